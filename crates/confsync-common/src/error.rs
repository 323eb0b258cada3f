//! Common error types for confsync.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`ConfsyncError`].
pub type ConfsyncResult<T> = Result<T, ConfsyncError>;

/// Transport-neutral classification of an error.
///
/// The daemon maps each class onto a gRPC status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing or malformed request field.
    InvalidArgument,
    /// The caller must perform another step first.
    FailedPrecondition,
    /// The referenced volume is unknown.
    NotFound,
    /// The request disagrees with already committed state.
    AlreadyExists,
    /// Deliberately unsupported operation.
    Unimplemented,
    /// Local failure (filesystem, mount table, worker).
    Internal,
}

/// Errors produced by the confsync plugin.
#[derive(Error, Diagnostic, Debug)]
pub enum ConfsyncError {
    /// A request field is missing or malformed.
    #[error("{message}")]
    #[diagnostic(code(confsync::invalid_argument))]
    InvalidArgument {
        /// Description of the offending field.
        message: String,
    },

    /// The operation requires a prior lifecycle step.
    #[error("{message}")]
    #[diagnostic(
        code(confsync::failed_precondition),
        help("Stage the volume before publishing it")
    )]
    FailedPrecondition {
        /// What is missing.
        message: String,
    },

    /// Volume not found.
    #[error("{message}")]
    #[diagnostic(code(confsync::volume::not_found))]
    NotFound {
        /// What was looked up.
        message: String,
    },

    /// A retried request conflicts with the committed state.
    #[error("{message}")]
    #[diagnostic(code(confsync::volume::conflict))]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// Feature not supported by this plugin.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(confsync::unsupported))]
    Unimplemented {
        /// The unsupported feature.
        feature: String,
    },

    /// Internal failure; the underlying cause has already been logged.
    #[error("{message}")]
    #[diagnostic(code(confsync::internal))]
    Internal {
        /// Caller-facing message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(confsync::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(confsync::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(confsync::config))]
    Config {
        /// The error message.
        message: String,
    },
}

impl ConfsyncError {
    /// Shorthand for [`ConfsyncError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for [`ConfsyncError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for [`ConfsyncError::Conflict`].
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Classify this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidArgument { .. } => ErrorClass::InvalidArgument,
            Self::FailedPrecondition { .. } => ErrorClass::FailedPrecondition,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Conflict { .. } => ErrorClass::AlreadyExists,
            Self::Unimplemented { .. } => ErrorClass::Unimplemented,
            Self::Internal { .. } | Self::Io(_) | Self::Serialization(_) | Self::Config { .. } => {
                ErrorClass::Internal
            }
        }
    }
}

impl From<serde_json::Error> for ConfsyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
