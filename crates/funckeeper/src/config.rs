use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use funckeeper_core::{resolve_offset, KeeperError};
use serde::{Deserialize, Serialize};
use time::UtcOffset;

pub const DEFAULT_DB_PATH: &str = "funckeeper.db";

/// Recorder settings. Hosts usually deserialize this from their own
/// configuration files; unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeeperConfig {
    pub db_path: PathBuf,
    /// Hours east of UTC. `None` uses the host's local offset.
    pub timezone_offset_hours: Option<f64>,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            timezone_offset_hours: None,
        }
    }
}

impl KeeperConfig {
    #[must_use]
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timezone_offset_hours(mut self, hours: f64) -> Self {
        self.timezone_offset_hours = Some(hours);
        self
    }

    /// # Errors
    /// Returns an error when `raw` is not a valid configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse funckeeper configuration")
    }

    /// # Errors
    /// Returns [`KeeperError::Configuration`] for an out-of-range offset.
    pub fn offset(&self) -> Result<UtcOffset, KeeperError> {
        resolve_offset(self.timezone_offset_hours)
    }
}
