//! Keyspace intervals and search modes.
//!
//! A keyspace is a half-open interval `[start, end)` over `u128`.
//! Bounds are written in config as decimal or `0x`-prefixed hex
//! strings; puzzle-sized intervals (~2^66) fit with ample headroom.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A half-open integer interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyspace {
    pub start: u128,
    pub end: u128,
}

impl Keyspace {
    /// Build a keyspace, rejecting empty or inverted intervals.
    pub fn new(start: u128, end: u128) -> Result<Self, ConfigError> {
        if start >= end {
            return Err(ConfigError::InvalidKeyspace {
                value: format!("[{start:#x}, {end:#x})"),
                reason: "start must be strictly below end".to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Parse bounds written as decimal or `0x` hex strings.
    pub fn parse(start: &str, end: &str) -> Result<Self, ConfigError> {
        Self::new(parse_bound(start)?, parse_bound(end)?)
    }

    /// Number of keys in the interval.
    pub fn width(&self) -> u128 {
        self.end - self.start
    }

    /// Whether `key` falls inside the interval.
    pub fn contains(&self, key: u128) -> bool {
        key >= self.start && key < self.end
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// Parse a single bound from decimal or `0x` hex notation.
pub fn parse_bound(s: &str) -> Result<u128, ConfigError> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u128::from_str_radix(hex, 16)
    } else {
        s.parse::<u128>()
    };
    parsed.map_err(|e| ConfigError::InvalidKeyspace {
        value: s.to_string(),
        reason: e.to_string(),
    })
}

/// How the keyspace is partitioned across workers.
///
/// This is a partitioning policy, not a search algorithm — the worker
/// binary interprets the mode on its own side of the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Random,
    Sequential,
    Smart,
    Kangaroo,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Random => "random",
            SearchMode::Sequential => "sequential",
            SearchMode::Smart => "smart",
            SearchMode::Kangaroo => "kangaroo",
        }
    }
}

impl FromStr for SearchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(SearchMode::Random),
            "sequential" => Ok(SearchMode::Sequential),
            "smart" => Ok(SearchMode::Smart),
            "kangaroo" => Ok(SearchMode::Kangaroo),
            other => Err(ConfigError::InvalidValue {
                field: "search.mode",
                reason: format!("unknown mode {other:?}"),
            }),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
