//! Entity identifier enumeration.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of one portal account (a roll number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Enumeration rules for entity ids.
///
/// Ids are `prefix + suffix` where the suffixes are first the zero-padded
/// numbers of `numeric_start..=numeric_end` (minus `excluded`), then every
/// `letter + digit` pair.
///
/// ```toml
/// [ids]
/// prefix = "237Z1A05"
/// numeric_start = 72
/// numeric_end = 99
/// excluded = ["80", "88"]
/// letters = "ABCD"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdConfig {
    pub prefix: String,
    pub numeric_start: u32,
    pub numeric_end: u32,
    pub numeric_width: usize,
    /// Suffixes to skip, compared against the rendered suffix.
    pub excluded: Vec<String>,
    pub letters: String,
    pub digits: String,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            prefix: "237Z1A05".to_string(),
            numeric_start: 72,
            numeric_end: 99,
            numeric_width: 2,
            excluded: vec!["80".to_string(), "88".to_string()],
            letters: "ABCD".to_string(),
            digits: "0123456789".to_string(),
        }
    }
}

/// Produces the finite, ordered list of entity ids for a run.
///
/// Generation is deterministic and side-effect free, so calling
/// [`generate`](Self::generate) again restarts the enumeration.
#[derive(Debug, Clone, Default)]
pub struct EntityIdSource {
    config: IdConfig,
}

impl EntityIdSource {
    pub fn new(config: IdConfig) -> Self {
        Self { config }
    }

    pub fn generate(&self) -> Vec<EntityId> {
        let cfg = &self.config;
        let numeric = (cfg.numeric_start..=cfg.numeric_end)
            .map(|n| format!("{:0width$}", n, width = cfg.numeric_width));
        let alpha = cfg.letters.chars().flat_map(|letter| {
            cfg.digits
                .chars()
                .map(move |digit| format!("{}{}", letter, digit))
        });

        numeric
            .chain(alpha)
            .filter(|suffix| !cfg.excluded.iter().any(|e| e == suffix))
            .map(|suffix| EntityId(format!("{}{}", cfg.prefix, suffix)))
            .collect()
    }
}
