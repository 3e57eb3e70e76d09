//! Storage driver contract.
//!
//! Every backend implements [`Driver`] and advertises a [`Capabilities`] value.
//! Serving and metadata code is written against the trait and the flags only.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬────────────────────────────┐
//! │ Driver       │ Flags                        │ Reached through            │
//! ├──────────────┼──────────────────────────────┼────────────────────────────┤
//! │ LocalDriver  │ PROXY_REQUIRED | LOCAL_READ  │ tokio::fs                  │
//! │ ObjectDriver │ UPLOAD_SENTINEL_REQUIRED     │ Apache OpenDAL (S3, Azure) │
//! │ RemoteDriver │ -                            │ slave HTTP protocol        │
//! └──────────────┴──────────────────────────────┴────────────────────────────┘
//! ```

mod capabilities;
mod local;
mod object;
mod registry;
mod remote;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_shared::{ChunkConfig, Signer};
use serde::{Deserialize, Serialize};

use crate::chunk::ConstantBackoff;
use crate::error::StorageError;
use crate::request::{UploadProps, UploadRequest};
use crate::upload::{UploadCredential, UploadSession};

pub use capabilities::{Capabilities, CapabilityFlags};
pub use local::LocalDriver;
pub use object::ObjectDriver;
pub use registry::{DriverRegistry, PolicyHandle, build_driver};
pub use remote::RemoteDriver;

/// Arguments for producing a source URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceArgs {
    /// Requested expiry; clamped into the driver's window.
    pub expire: Option<DateTime<Utc>>,
    /// Ask the client to save instead of display.
    pub is_download: bool,
    /// Bytes per second, 0 for unlimited.
    pub speed: u64,
    /// File name shown to the client.
    pub display_name: String,
}

/// An object as it exists in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalObject {
    /// Base name.
    pub name: String,
    /// Path inside the policy.
    pub source: String,
    /// Path relative to the listed directory.
    pub relative_path: String,
    /// Size in bytes; 0 for directories.
    pub size: u64,
    /// Whether this is a directory.
    pub is_dir: bool,
    /// Last modification time, when the backend reports one.
    #[serde(default)]
    pub last_modify: Option<DateTime<Utc>>,
}

/// One media metadata entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMeta {
    /// Metadata key, e.g. `width`.
    pub key: String,
    /// Metadata value.
    pub value: String,
    /// Metadata namespace, e.g. `exif` or `stream`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Site-wide values every driver needs.
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// Site identifier sent to slave nodes.
    pub site_id: String,
    /// Public base URL of this site, without trailing slash.
    pub site_url: String,
    /// Signs application-issued URLs.
    pub signer: Signer,
    /// Chunk engine settings.
    pub chunk: ChunkConfig,
    /// Lifetime of signed node-to-node requests.
    pub request_ttl: Duration,
}

impl DriverContext {
    /// Backoff policy built from the chunk settings.
    #[must_use]
    pub fn backoff(&self) -> ConstantBackoff {
        ConstantBackoff::new(
            Duration::from_millis(self.chunk.retry_sleep_ms),
            self.chunk.max_retries,
        )
    }

    /// Effective chunk size for a policy override (0 keeps the site default).
    #[must_use]
    pub const fn chunk_size(&self, policy_chunk_size: u64) -> u64 {
        if policy_chunk_size == 0 {
            self.chunk.size
        } else {
            policy_chunk_size
        }
    }
}

/// A storage backend.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    /// Store the bytes of `file` at `file.props.path`.
    async fn put(&self, file: UploadRequest) -> Result<(), StorageError>;

    /// Delete objects. Failing paths are reported through `PartialDelete`.
    async fn delete(&self, files: &[String]) -> Result<(), StorageError>;

    /// Open an object for reading. Only for drivers with `LOCAL_READ`.
    async fn open(&self, path: &str) -> Result<tokio::fs::File, StorageError> {
        let _ = path;
        Err(StorageError::Unsupported("open"))
    }

    /// Filesystem path of an object. Only for drivers with `LOCAL_READ`.
    fn local_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        let _ = path;
        Err(StorageError::Unsupported("local_path"))
    }

    /// URL of a thumbnail rendered by the backend.
    async fn thumb(
        &self,
        path: &str,
        ext: &str,
        expire: Option<DateTime<Utc>>,
    ) -> Result<String, StorageError>;

    /// Direct URL for reading an object.
    async fn source(&self, path: &str, args: &SourceArgs) -> Result<String, StorageError>;

    /// Prepare the backend for a client upload and return its credential.
    async fn token(
        &self,
        session: &mut UploadSession,
        file: &UploadProps,
    ) -> Result<UploadCredential, StorageError>;

    /// Abort a prepared upload and release backend state.
    async fn cancel_token(&self, session: &UploadSession) -> Result<(), StorageError>;

    /// Verify and finalize a client upload.
    async fn complete_upload(&self, session: &UploadSession) -> Result<(), StorageError>;

    /// What this driver can do.
    fn capabilities(&self) -> &Capabilities;

    /// Extract media metadata.
    async fn media_meta(&self, path: &str, ext: &str) -> Result<Vec<MediaMeta>, StorageError>;

    /// List objects under `path`.
    async fn list(&self, path: &str, recursive: bool)
    -> Result<Vec<PhysicalObject>, StorageError>;
}

/// Percent-encoded path segment.
pub(crate) fn encode_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}
