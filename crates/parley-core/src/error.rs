//! Typed errors for the reconciler and its configuration

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("a turn is still streaming into message {message_id}")]
    TurnInProgress { message_id: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("event router has shut down")]
    Closed,

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
