use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vmcp_store::{LogConfig, SyncMode};

use crate::error::{CheckpointError, CheckpointResult};

/// Where and how a [`Checkpointer`](crate::Checkpointer) persists its store.
///
/// ```toml
/// path = "/var/lib/vm/checkpoint"
/// sync_mode = "every_write"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Directory holding the store log.
    pub path: PathBuf,
    /// Durability of each write. Anything other than `every_write` gives up
    /// the write-through guarantee.
    pub sync_mode: SyncMode,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("checkpoint"),
            sync_mode: SyncMode::EveryWrite,
        }
    }
}

impl CheckpointConfig {
    /// Default configuration rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> CheckpointResult<Self> {
        toml::from_str(s).map_err(|e| CheckpointError::Config(e.to_string()))
    }

    /// Read a TOML configuration file.
    pub fn load(path: &Path) -> CheckpointResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| CheckpointError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub(crate) fn log_config(&self) -> LogConfig {
        LogConfig {
            sync_mode: self.sync_mode,
        }
    }
}
