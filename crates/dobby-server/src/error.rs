//! Error types for dobby-server

use dobby_core::{CursorError, PatternError, SettingsError};
use thiserror::Error;

/// Errors from the pattern store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored pattern JSON could not be (de)serialized
    #[error("pattern encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// No pattern with this name
    #[error("no such pattern: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors talking to the loom.
#[derive(Debug, Error)]
pub enum LoomError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No loom connection is open
    #[error("not connected to the loom")]
    NotConnected,

    /// The loom sent something we do not understand
    #[error("invalid loom reply: {0}")]
    Protocol(String),
}

impl From<tokio_util::codec::AnyDelimiterCodecError> for LoomError {
    fn from(err: tokio_util::codec::AnyDelimiterCodecError) -> Self {
        match err {
            tokio_util::codec::AnyDelimiterCodecError::Io(e) => LoomError::Io(e),
            other => LoomError::Protocol(other.to_string()),
        }
    }
}

/// Why a client command failed.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The user can fix this: bad arguments, missing pattern, etc.
    #[error("{0}")]
    Invalid(String),

    /// A loom write failed
    #[error(transparent)]
    Loom(#[from] LoomError),

    /// Anything else; logged in full and reported generically
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommandError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

impl From<CursorError> for CommandError {
    fn from(err: CursorError) -> Self {
        Self::Invalid(err.to_string())
    }
}

impl From<PatternError> for CommandError {
    fn from(err: PatternError) -> Self {
        Self::Invalid(err.to_string())
    }
}

impl From<SettingsError> for CommandError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::Invalid(msg) => Self::Invalid(msg),
            other => Self::Internal(other.into()),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => Self::Invalid(format!("no such pattern: {name}")),
            other => Self::Internal(other.into()),
        }
    }
}

pub type CommandResult<T = ()> = std::result::Result<T, CommandError>;
