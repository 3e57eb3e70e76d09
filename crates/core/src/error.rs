//! Storage error types.

use std::time::Duration;

use nimbus_shared::SignatureError;
use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Uploaded content exceeds the size announced for the upload.
    #[error("file size {size} bytes exceeds maximum allowed {max} bytes")]
    FileTooLarge {
        /// Actual file size.
        size: u64,
        /// Maximum allowed size.
        max: u64,
    },

    /// File not found in storage.
    #[error("file not found: {key}")]
    NotFound {
        /// Storage key that was not found.
        key: String,
    },

    /// Target exists and the upload did not ask to overwrite it.
    #[error("object already exists: {key}")]
    ObjectExisted {
        /// Storage key that already exists.
        key: String,
    },

    /// Operation is not offered by this backend.
    #[error("operation not supported by storage driver: {0}")]
    Unsupported(&'static str),

    /// Storage provider configuration error.
    #[error("storage configuration error: {0}")]
    Configuration(String),

    /// Backend operation error.
    #[error("storage operation failed: {0}")]
    Operation(String),

    /// Invalid storage key format.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    /// Local I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport failure while talking to a node or vendor.
    #[error("http transport error: {0}")]
    Http(String),

    /// Backend asked us to slow down.
    #[error("backend throttled the request, retry after {retry_after:?}: {message}")]
    Throttled {
        /// Delay requested by the backend.
        retry_after: Duration,
        /// Backend message.
        message: String,
    },

    /// A slave node answered with a non-zero status code.
    #[error("remote node error {code}: {message}")]
    Remote {
        /// Envelope status code.
        code: i32,
        /// Envelope error message.
        message: String,
    },

    /// Batch deletion left some objects behind.
    #[error("failed to delete {} object(s): {message}", failed.len())]
    PartialDelete {
        /// Keys that could not be deleted.
        failed: Vec<String>,
        /// Last error observed.
        message: String,
    },

    /// Stored size differs from the size declared for the upload.
    #[error("file size mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        /// Expected file size.
        expected: u64,
        /// Actual file size.
        actual: u64,
    },

    /// Chunk index outside `[0, num)`.
    #[error("chunk index {index} out of range for {num} chunk(s)")]
    ChunkOutOfRange {
        /// Requested index.
        index: i64,
        /// Number of chunks.
        num: usize,
    },

    /// A chunk failed permanently after retries.
    #[error("failed to upload chunk #{index}: {source}")]
    Chunk {
        /// Index of the failed chunk.
        index: i64,
        /// Last error observed.
        #[source]
        source: Box<StorageError>,
    },

    /// Upload session does not exist or has expired.
    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Signature could not be produced or verified.
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),
}

impl StorageError {
    /// Create a not found error.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create an object existed error.
    #[must_use]
    pub fn object_existed(key: impl Into<String>) -> Self {
        Self::ObjectExisted { key: key.into() }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an operation error.
    #[must_use]
    pub fn operation(msg: impl Into<String>) -> Self {
        Self::Operation(msg.into())
    }

    /// Create a size mismatch error.
    #[must_use]
    pub fn size_mismatch(expected: u64, actual: u64) -> Self {
        Self::SizeMismatch { expected, actual }
    }

    /// Wrap an error with the index of the chunk that produced it.
    #[must_use]
    pub fn chunk(index: i64, source: Self) -> Self {
        Self::Chunk {
            index,
            source: Box::new(source),
        }
    }

    /// Returns true if the error, or the error it wraps, is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Chunk { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Returns true if the error, or the error it wraps, means the object is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Self::Chunk { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<opendal::Error> for StorageError {
    fn from(err: opendal::Error) -> Self {
        match err.kind() {
            opendal::ErrorKind::NotFound => Self::NotFound {
                key: err.to_string(),
            },
            opendal::ErrorKind::Unsupported => Self::Unsupported("backend operation"),
            opendal::ErrorKind::AlreadyExists | opendal::ErrorKind::ConditionNotMatch => {
                Self::ObjectExisted {
                    key: err.to_string(),
                }
            }
            opendal::ErrorKind::RateLimited => Self::Throttled {
                retry_after: Duration::ZERO,
                message: err.to_string(),
            },
            _ => Self::Operation(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
