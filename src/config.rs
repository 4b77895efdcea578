//! Store configuration
//!
//! Loaded from JSON, every field optional:
//!
//! ```json
//! {
//!   "limits": { "max_key_size": 65536, "max_value_size": null, "max_entries": 1000000 },
//!   "sync": "buffered",
//!   "auto_compact": true,
//!   "compaction_min_bytes": 4194304,
//!   "compaction_ratio": 2.0
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KVStoreError, Result};

/// Default maximum key size (64KB)
pub const DEFAULT_MAX_KEY_SIZE: usize = 64 * 1024;

/// Default maximum value size (64MB)
pub const DEFAULT_MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

/// Default log size below which compaction never runs (4MB)
pub const DEFAULT_COMPACTION_MIN_BYTES: u64 = 4 * 1024 * 1024;

pub const DEFAULT_COMPACTION_RATIO: f64 = 2.0;

/// Size and count limits enforced on writes. `None` disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_key_size: Option<usize>,
    pub max_value_size: Option<usize>,
    pub max_entries: Option<usize>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_key_size: Some(DEFAULT_MAX_KEY_SIZE),
            max_value_size: Some(DEFAULT_MAX_VALUE_SIZE),
            max_entries: None,
        }
    }
}

impl Limits {
    pub const UNBOUNDED: Limits = Limits {
        max_key_size: None,
        max_value_size: None,
        max_entries: None,
    };

    pub fn check_key(&self, key: &[u8]) -> Result<()> {
        check("key size", key.len(), self.max_key_size)
    }

    pub fn check_value(&self, value: &[u8]) -> Result<()> {
        check("value size", value.len(), self.max_value_size)
    }

    /// Checks the number of entries a write would leave in the store.
    pub fn check_entries(&self, count: usize) -> Result<()> {
        check("entry count", count, self.max_entries)
    }
}

fn check(what: &'static str, size: usize, max: Option<usize>) -> Result<()> {
    match max {
        Some(max) if size > max => Err(KVStoreError::CapacityExceeded { what, size, max }),
        _ => Ok(()),
    }
}

/// When committed writes are flushed to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// fsync after every commit
    #[default]
    Always,
    /// leave writes in the OS page cache; fsync on stop and compaction
    Buffered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub limits: Limits,
    pub sync: SyncPolicy,
    pub auto_compact: bool,
    /// Log size below which automatic compaction never runs
    pub compaction_min_bytes: u64,
    /// Compact once the log is this many times larger than the live data
    pub compaction_ratio: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            sync: SyncPolicy::default(),
            auto_compact: true,
            compaction_min_bytes: DEFAULT_COMPACTION_MIN_BYTES,
            compaction_ratio: DEFAULT_COMPACTION_RATIO,
        }
    }
}

impl StoreConfig {
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: StoreConfig = serde_json::from_str(content)
            .map_err(|e| KVStoreError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.compaction_ratio.is_nan() || self.compaction_ratio < 1.0 {
            return Err(KVStoreError::Config(format!(
                "compaction_ratio must be at least 1.0, got {}",
                self.compaction_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = StoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.limits.max_key_size, Some(DEFAULT_MAX_KEY_SIZE));
        assert_eq!(config.sync, SyncPolicy::Always);
    }

    #[test]
    fn test_partial_json() {
        let config = StoreConfig::from_json_str(
            r#"{"sync": "buffered", "limits": {"max_value_size": null, "max_entries": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.sync, SyncPolicy::Buffered);
        assert_eq!(config.limits.max_key_size, Some(DEFAULT_MAX_KEY_SIZE));
        assert_eq!(config.limits.max_value_size, None);
        assert_eq!(config.limits.max_entries, Some(10));
        assert!(config.auto_compact);
    }

    #[test]
    fn test_invalid_config() {
        let result = StoreConfig::from_json_str(r#"{"compaction_ratio": 0.5}"#);
        assert!(matches!(result, Err(KVStoreError::Config(_))));

        let result = StoreConfig::from_json_str(r#"{"sync": "sometimes"}"#);
        assert!(matches!(result, Err(KVStoreError::Config(_))));
    }

    #[test]
    fn test_limits() {
        let limits = Limits {
            max_key_size: Some(2),
            max_value_size: Some(3),
            max_entries: Some(1),
        };
        assert!(limits.check_key(b"ab").is_ok());
        assert!(matches!(
            limits.check_key(b"abc"),
            Err(KVStoreError::CapacityExceeded { size: 3, max: 2, .. })
        ));
        assert!(limits.check_value(b"abcd").is_err());
        assert!(limits.check_entries(2).is_err());
        assert!(Limits::UNBOUNDED.check_entries(usize::MAX).is_ok());
    }
}
