//! Error types for the callflow runtime
//!
//! Domain errors use thiserror. Configuration-time and handle-acquisition
//! failures abort a whole batch; row-level problems never show up here, they
//! are captured as [`crate::invoker::RowFailure`] values instead.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error for registry, backend and invoker operations
#[derive(Debug, Error)]
pub enum CallError {
    /// The callee location could not be resolved
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// The callee failed to instantiate
    #[error("Failed to load workflow at {location}: {detail}")]
    Load {
        /// Canonical location of the callee
        location: String,
        /// Loader-supplied reason
        detail: String,
    },

    /// Waiting for exclusive use of a handle was cancelled
    #[error("Interrupted while waiting for workflow at {location}")]
    LockInterrupted {
        /// Canonical location of the contended handle
        location: String,
    },

    /// Parameter name or type mismatch when binding inputs
    #[error("Invalid parameter '{name}': {detail}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// What was wrong with it
        detail: String,
    },

    /// The handle was disposed before it could be used
    #[error("Workflow handle for {0} has been disposed")]
    HandleDisposed(String),

    /// The registry has been shut down
    #[error("Handle registry is shut down")]
    RegistryClosed,

    /// Invalid node settings
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence failures
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Backend failure outside of a normal (failed) callee run
    #[error("Execution error: {0}")]
    Execution(String),
}

impl CallError {
    /// Shorthand for an [`CallError::InvalidParameter`] error.
    pub fn invalid_parameter(name: impl Into<String>, detail: impl Into<String>) -> Self {
        CallError::InvalidParameter {
            name: name.into(),
            detail: detail.into(),
        }
    }

    /// Shorthand for a [`CallError::Load`] error.
    pub fn load(location: impl ToString, detail: impl Into<String>) -> Self {
        CallError::Load {
            location: location.to_string(),
            detail: detail.into(),
        }
    }
}

/// Location resolution errors
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// Empty location string
    #[error("No workflow location given")]
    Empty,

    /// URI scheme is not one we know how to map to a local file
    #[error("Unsupported URI scheme '{0}'")]
    UnsupportedScheme(String),

    /// Reference URI with an unknown anchor
    #[error("Unknown reference '{0}', expected 'workspace' or 'context'")]
    UnknownReference(String),

    /// URI parsed but cannot be mapped to a local path
    #[error("Invalid URI '{0}'")]
    InvalidUri(String),

    /// Resolved location does not exist
    #[error("Workflow location does not exist: {0}")]
    NotFound(PathBuf),

    /// Resolved location exists but is not a directory
    #[error("Workflow location is not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Node settings errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required key missing from the settings tree
    #[error("Missing setting '{0}'")]
    MissingKey(String),

    /// Key present with the wrong shape (value vs subtree)
    #[error("Setting '{0}' has the wrong type")]
    WrongType(String),

    /// Stored JSON text does not parse
    #[error("Invalid JSON for parameter '{name}': {detail}")]
    InvalidJson {
        /// Parameter name
        name: String,
        /// Parser message
        detail: String,
    },

    /// Parameter bound both statically and to a field
    #[error("Parameter '{0}' is bound both to a static value and to a column")]
    DuplicateBinding(String),

    /// Bound field is absent from the input schema
    #[error("Column '{column}' bound to parameter '{parameter}' does not exist in the input table")]
    UnknownColumn {
        /// Parameter name
        parameter: String,
        /// Missing column name
        column: String,
    },

    /// Bound field exists but is not JSON-typed
    #[error("Column '{column}' bound to parameter '{parameter}' is not a JSON column")]
    NotJsonColumn {
        /// Parameter name
        parameter: String,
        /// Offending column name
        column: String,
    },
}

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for resolver operations
pub type ResolutionResult<T> = std::result::Result<T, ResolutionError>;

/// Convenience result alias for settings operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Convenience result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type using CallError
pub type Result<T> = std::result::Result<T, CallError>;
