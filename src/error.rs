// Error types shared by every layer of the core
// Library code returns these as values; only main.rs reaches for anyhow

use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// System playlists reject deletion and identity changes.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaIncompatible { found: u32, supported: u32 },

    #[error("decoder failure on {path}: {reason}")]
    DecoderFailure { path: String, reason: String },

    #[error("failed to load queue item {item_id}: {reason}")]
    LoadError { item_id: String, reason: String },

    #[error("playback stopped after {0} consecutive load errors")]
    QueueExhaustedByErrors(u32),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("playback engine is not running")]
    EngineUnavailable,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    /// Collapse a detailed error into the small set the UI shows.
    pub fn user_facing(&self) -> UserFacingError {
        match self {
            EngineError::DecoderFailure { .. }
            | EngineError::LoadError { .. }
            | EngineError::QueueExhaustedByErrors(_)
            | EngineError::Timeout(_)
            | EngineError::EngineUnavailable => UserFacingError::CannotPlayFile,
            EngineError::StoreUnavailable(_)
            | EngineError::SchemaIncompatible { .. }
            | EngineError::PermissionDenied(_)
            | EngineError::Io(_) => UserFacingError::LibraryUnavailable,
            EngineError::SerializationError(_) => UserFacingError::ImportFailed,
            EngineError::InvalidArgument(_)
            | EngineError::NotFound(_)
            | EngineError::Conflict(_)
            | EngineError::Forbidden(_) => UserFacingError::InvalidRequest,
        }
    }
}

/// What the coordinator hands back to the UI. The detailed error is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserFacingError {
    CannotPlayFile,
    LibraryUnavailable,
    ImportFailed,
    InvalidRequest,
}

impl fmt::Display for UserFacingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            UserFacingError::CannotPlayFile => "cannot play this file",
            UserFacingError::LibraryUnavailable => "library unavailable",
            UserFacingError::ImportFailed => "import failed",
            UserFacingError::InvalidRequest => "request not allowed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for UserFacingError {}
