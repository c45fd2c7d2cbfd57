//! Reconciler configuration
//!
//! Read from `~/.parley/config.toml` unless a path is given. Every field has a
//! default, so a missing file or a partial file is fine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

/// What to do when a user turn begins while the assistant is still streaming
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewTurnPolicy {
    /// Refuse the new turn
    #[default]
    Reject,
    /// Stop the open turn as if cancelled, then start the new one
    ForceClose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Debug lines buffered per turn; oldest are dropped past this
    pub max_debug_lines: usize,
    /// Characters per token for thinking-token estimates
    pub chars_per_token: usize,
    pub new_turn_policy: NewTurnPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_debug_lines: 500,
            chars_per_token: 4,
            new_turn_policy: NewTurnPolicy::Reject,
        }
    }
}

impl ReconcilerConfig {
    /// `~/.parley/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".parley").join("config.toml"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => {
                debug!("No home directory; using default reconciler config");
                Ok(Self::default())
            }
        }
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No config at {:?}; using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        info!("Loaded reconciler config from {:?}", path);
        Ok(config)
    }
}
