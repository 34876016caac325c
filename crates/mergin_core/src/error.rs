use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for engine operations
///
/// Every variant carries a human-readable message; variants produced from
/// server replies additionally carry the `detail` string extracted from the
/// error JSON body when the server provides one.
#[derive(Debug, Error)]
pub enum MerginError {
    /// The request never reached the server (DNS, connect, broken transfer).
    ///
    /// Transient by nature, but the engine does not retry on its own: the
    /// transaction fails once and the caller re-invokes the operation.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The server answered with an unexpected HTTP status code.
    #[error("server returned HTTP {code}: {detail}")]
    HttpStatus {
        /// Status code of the reply
        code: u16,
        /// Error detail extracted from the reply body (or the raw body)
        detail: String,
    },

    /// Authentication is missing, expired, or was rejected.
    ///
    /// The engine retries the failing request once after refreshing the
    /// token from stored credentials; this error surfaces only after that
    /// retry also failed.
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// The project (or another addressed resource) does not exist on the server.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server rejected the request because of a conflicting concurrent change.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The upload would exceed the user's storage quota.
    #[error("storage limit exceeded: {0}")]
    StorageLimitExceeded(String),

    /// The on-disk or server-sent project metadata could not be parsed.
    #[error("corrupt project metadata in '{path}': {reason}")]
    MetadataCorrupt {
        /// Location of the offending metadata (file path or URL)
        path: String,
        /// What failed while parsing
        reason: String,
    },

    /// A downloaded file did not hash to the checksum announced by the server.
    ///
    /// Fails the whole transaction; staged data is discarded and the working
    /// copy is left untouched.
    #[error("checksum mismatch for '{path}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Project-relative path of the file
        path: String,
        /// Checksum announced in the server metadata
        expected: String,
        /// Checksum of the received bytes
        actual: String,
    },

    /// A local filesystem operation failed.
    #[error("local I/O error on '{path}': {source}")]
    LocalIo {
        /// Path of the file or directory involved
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The operation was cancelled by the user.
    #[error("cancelled")]
    Cancelled,

    /// Another transaction for the same project is already running.
    #[error("sync already in progress for '{0}'")]
    AlreadyInProgress(String),

    /// The server speaks an API version this client does not support.
    #[error("incompatible server version: {0}")]
    VersionIncompatible(String),
}

impl MerginError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MerginError::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Server `detail` string, when this error carries one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            MerginError::HttpStatus { detail, .. } => Some(detail),
            MerginError::Unauthorized(d)
            | MerginError::NotFound(d)
            | MerginError::Conflict(d)
            | MerginError::StorageLimitExceeded(d) => Some(d),
            _ => None,
        }
    }

    /// True when the operation ended because of [`MerginError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MerginError::Cancelled)
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, MerginError>;
