//! Sync engine configuration.
//!
//! `SyncConfig` is plain serde data so embedding apps can keep it next to
//! their own settings; every field has a default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What to do with mutations whose author no longer exists locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Move them out of pending state with a "discarded" marker
    #[default]
    Discard,
    /// Leave them pending for manual cleanup
    Retain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed attempts after which a mutation is abandoned (`None` = never)
    pub max_retry_count: Option<u32>,
    pub orphan_policy: OrphanPolicy,
    /// Scheduler cooldown between attempts for one scope
    pub throttle_ms: u64,
    pub database_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retry_count: Some(10),
            orphan_policy: OrphanPolicy::Discard,
            throttle_ms: 1000,
            database_path: None,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retry_count == Some(0) {
            return Err(ConfigError::Invalid(
                "max_retry_count must be at least 1 (use null for unbounded)".to_string(),
            ));
        }
        Ok(())
    }
}
