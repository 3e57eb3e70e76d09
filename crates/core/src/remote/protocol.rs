//! Wire types of the slave node protocol.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::upload::UploadSession;

/// Route prefix of the slave API.
pub const SLAVE_API_PREFIX: &str = "/api/v1/slave";

/// Site identifier of the calling master.
pub const HEADER_SITE_ID: &str = "X-Cr-Site-Id";
/// Public URL of the calling master.
pub const HEADER_SITE_URL: &str = "X-Cr-Site-Url";
/// Node identifier the master knows the slave by.
pub const HEADER_NODE_ID: &str = "X-Cr-Node-Id";
/// Correlation id for log stitching across nodes.
pub const HEADER_CORRELATION_ID: &str = "X-Cr-Correlation-Id";
/// Whether a chunk may overwrite an existing object.
pub const HEADER_OVERWRITE: &str = "Cr-Overwrite";

/// Identity headers covered by a request signature.
pub const SIGNED_HEADERS: [&str; 4] = [
    HEADER_SITE_ID,
    HEADER_SITE_URL,
    HEADER_NODE_ID,
    HEADER_CORRELATION_ID,
];

/// Success.
pub const CODE_OK: i32 = 0;
/// Batch operation partially failed; `data` lists what failed.
pub const CODE_NOT_FULLY_SUCCESS: i32 = 203;
/// Malformed request.
pub const CODE_PARAM_ERROR: i32 = 40001;
/// Signature missing, expired, or wrong.
pub const CODE_CREDENTIAL_INVALID: i32 = 40002;
/// Target object exists.
pub const CODE_OBJECT_EXISTED: i32 = 40004;
/// Session or object not found.
pub const CODE_NOT_FOUND: i32 = 40404;
/// Operation not offered by the node's backend.
pub const CODE_NOT_SUPPORTED: i32 = 40005;
/// Anything else.
pub const CODE_INTERNAL_ERROR: i32 = 50001;

/// Response envelope: `{code, data, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// 0 on success.
    pub code: i32,
    /// Payload. List payloads are JSON-encoded strings.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    /// Error message when `code` is non-zero.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Envelope {
    /// Successful response without data.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: CODE_OK,
            data: serde_json::Value::Null,
            error: String::new(),
        }
    }

    /// Successful response carrying `data` serialized as a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` cannot be serialized.
    pub fn with_serialized<T: Serialize>(data: &T) -> Result<Self, StorageError> {
        let encoded =
            serde_json::to_string(data).map_err(|e| StorageError::operation(e.to_string()))?;
        Ok(Self {
            code: CODE_OK,
            data: serde_json::Value::String(encoded),
            error: String::new(),
        })
    }

    /// Failed response.
    #[must_use]
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            data: serde_json::Value::Null,
            error: message.into(),
        }
    }

    /// Failed response describing a storage error.
    #[must_use]
    pub fn from_storage_error(err: &StorageError) -> Self {
        match err {
            StorageError::PartialDelete { failed, message } => Self {
                code: CODE_NOT_FULLY_SUCCESS,
                data: serde_json::to_string(failed)
                    .map(serde_json::Value::String)
                    .unwrap_or_default(),
                error: message.clone(),
            },
            StorageError::Remote { code, message } => Self::error(*code, message.clone()),
            other => Self::error(error_code(other), other.to_string()),
        }
    }

    /// Turn the envelope into its payload or a typed error.
    ///
    /// # Errors
    ///
    /// `PartialDelete` for code 203, `Remote` for any other non-zero code.
    pub fn into_result(self) -> Result<serde_json::Value, StorageError> {
        match self.code {
            CODE_OK => Ok(self.data),
            CODE_NOT_FULLY_SUCCESS => Err(StorageError::PartialDelete {
                failed: decode_data(self.data).unwrap_or_default(),
                message: self.error,
            }),
            code => Err(StorageError::Remote {
                code,
                message: self.error,
            }),
        }
    }
}

/// Envelope code for a storage error.
#[must_use]
pub fn error_code(err: &StorageError) -> i32 {
    match err {
        StorageError::InvalidKey(_)
        | StorageError::ChunkOutOfRange { .. }
        | StorageError::SizeMismatch { .. }
        | StorageError::FileTooLarge { .. } => CODE_PARAM_ERROR,
        StorageError::Signature(_) => CODE_CREDENTIAL_INVALID,
        StorageError::ObjectExisted { .. } => CODE_OBJECT_EXISTED,
        StorageError::NotFound { .. } | StorageError::SessionNotFound(_) => CODE_NOT_FOUND,
        StorageError::Unsupported(_) => CODE_NOT_SUPPORTED,
        StorageError::Remote { code, .. } => *code,
        StorageError::Chunk { source, .. } => error_code(source),
        _ => CODE_INTERNAL_ERROR,
    }
}

/// Decode a payload that is either inline JSON or a JSON-encoded string.
///
/// # Errors
///
/// Returns an error if the payload does not match `T`.
pub fn decode_data<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, StorageError> {
    let decoded = match data {
        serde_json::Value::String(encoded) => serde_json::from_str(&encoded),
        other => serde_json::from_value(other),
    };
    decoded.map_err(|e| StorageError::operation(format!("invalid slave response: {e}")))
}

/// Body of `PUT upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUploadSessionRequest {
    /// Session to create on the node.
    pub session: UploadSession,
    /// Whether the upload may overwrite.
    #[serde(default)]
    pub overwrite: bool,
}

/// Body of `DELETE file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFilesRequest {
    /// Paths to delete.
    pub files: Vec<String>,
}

/// Query of `GET file/list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    /// Directory to list.
    #[serde(default)]
    pub path: String,
    /// Descend into subdirectories.
    #[serde(default)]
    pub recursive: bool,
}

/// Query of `POST upload/{session_id}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkQuery {
    /// Zero-based chunk index.
    #[serde(default)]
    pub chunk: usize,
}

/// Data of `GET upload/{session_id}` while the session is live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    /// Distinct chunks stored so far.
    pub received: usize,
    /// Chunks the session expects.
    pub total: usize,
}
