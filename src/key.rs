//! Typed cache keys.
//!
//! Keys are written as colon-separated strings whose first segment names the
//! upstream [`Source`]:
//!
//! - `weather:<location>`
//! - `mandi:<commodity>:<market>`
//! - `commodity:<symbol>`
//!
//! Segments are trimmed and lower-cased, so `weather:Indore` and
//! `weather:indore` address the same entry.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Upstream source a key is fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Weather,
    Mandi,
    Commodity,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Weather, Source::Mandi, Source::Commodity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Weather => "weather",
            Source::Mandi => "mandi",
            Source::Commodity => "commodity",
        }
    }

    /// Number of segments following the prefix.
    fn arity(&self) -> usize {
        match self {
            Source::Weather | Source::Commodity => 1,
            Source::Mandi => 2,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weather" => Ok(Source::Weather),
            "mandi" => Ok(Source::Mandi),
            "commodity" => Ok(Source::Commodity),
            other => Err(CacheError::InvalidKey(format!("unknown source '{other}'"))),
        }
    }
}

/// Identifier of one cacheable resource.
///
/// Cheap to clone (the canonical string is shared).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    source: Source,
    canonical: Arc<str>,
}

impl Key {
    /// Parse and normalise a key string.
    pub fn parse(raw: &str) -> Result<Self, CacheError> {
        let mut parts = raw.split(':');
        let prefix = parts.next().unwrap_or_default();
        let source: Source = prefix.parse()?;

        let segments: Vec<String> = parts.map(|s| s.trim().to_lowercase()).collect();
        if segments.len() != source.arity() {
            return Err(CacheError::InvalidKey(format!(
                "'{raw}': {source} keys take {} segment(s), got {}",
                source.arity(),
                segments.len()
            )));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(CacheError::InvalidKey(format!("'{raw}': empty segment")));
        }

        let canonical = format!("{source}:{}", segments.join(":"));
        Ok(Self {
            source,
            canonical: canonical.into(),
        })
    }

    /// Build a `weather:<location>` key.
    pub fn weather(location: &str) -> Result<Self, CacheError> {
        Self::parse(&format!("weather:{location}"))
    }

    /// Build a `mandi:<commodity>:<market>` key.
    pub fn mandi(commodity: &str, market: &str) -> Result<Self, CacheError> {
        Self::parse(&format!("mandi:{commodity}:{market}"))
    }

    /// Build a `commodity:<symbol>` key.
    pub fn commodity(symbol: &str) -> Result<Self, CacheError> {
        Self::parse(&format!("commodity:{symbol}"))
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Segments after the source prefix, e.g. `["wheat", "indore"]` for
    /// `mandi:wheat:indore`.
    pub fn segments(&self) -> Vec<&str> {
        self.canonical.split(':').skip(1).collect()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for Key {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::parse(s)
    }
}
