//! Error types for dobby-core

use thiserror::Error;

/// Errors raised while stepping or positioning a pattern cursor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    /// Tried to step before the first pick or end of the first repeat.
    #[error("at start of sequence")]
    StartOfSequence,

    /// A position outside the pattern was requested.
    #[error("{0}")]
    OutOfRange(String),
}

/// Errors raised while reading or validating a pattern file.
#[derive(Debug, Error)]
pub enum PatternError {
    /// The file suffix names a format we cannot read
    #[error("unsupported file type {0:?}")]
    UnsupportedFileType(String),

    /// Malformed WIF content
    #[error("invalid WIF file: {0}")]
    Wif(String),

    /// Malformed JSON pattern
    #[error("invalid JSON pattern: {0}")]
    Json(#[from] serde_json::Error),

    /// The pattern parsed but cannot be woven
    #[error("invalid pattern: {0}")]
    Invalid(String),
}

/// Errors raised by settings validation and persistence.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A field failed validation
    #[error("{0}")]
    Invalid(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Errors raised by total-number arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("repeat length {0} must be positive")]
pub struct RepeatLengthError(pub i64);
