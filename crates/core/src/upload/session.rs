//! Upload session and the credential handed back to clients.

use chrono::{DateTime, Utc};
use nimbus_shared::types::{PolicyId, SentinelTaskId, UploadSessionId};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Server-side state of one in-flight upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Session identifier.
    pub id: UploadSessionId,
    /// Upload identifier assigned by the backend, if it has one.
    #[serde(default)]
    pub upload_id: String,
    /// Target path inside the policy.
    pub path: String,
    /// Size announced by the client.
    pub size: u64,
    /// Chunk size the client must use.
    pub chunk_size: u64,
    /// MIME type announced by the client.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Replace an existing object.
    #[serde(default)]
    pub overwrite: bool,
    /// When the session stops accepting data.
    pub expires_at: DateTime<Utc>,
    /// URL the storage node calls once the upload finishes.
    #[serde(default)]
    pub callback: String,
    /// Policy the upload lands in.
    pub policy_id: PolicyId,
    /// Cleanup task armed for backends that need one.
    #[serde(default)]
    pub sentinel_task: Option<SentinelTaskId>,
}

impl UploadSession {
    /// Create a session for `size` bytes at `path`.
    #[must_use]
    pub fn new(
        policy_id: PolicyId,
        path: impl Into<String>,
        size: u64,
        chunk_size: u64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UploadSessionId::new(),
            upload_id: String::new(),
            path: path.into(),
            size,
            chunk_size,
            mime_type: None,
            overwrite: false,
            expires_at,
            callback: String::new(),
            policy_id,
            sentinel_task: None,
        }
    }

    /// Set the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: Option<String>) -> Self {
        self.mime_type = mime_type;
        self
    }

    /// Allow replacing an existing object.
    #[must_use]
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Set the completion callback.
    #[must_use]
    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = callback.into();
        self
    }

    /// Number of chunks the client is expected to send.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        if self.size == 0 || self.chunk_size == 0 {
            return 1;
        }
        usize::try_from(self.size.div_ceil(self.chunk_size)).unwrap_or(usize::MAX)
    }

    /// Offset and length of chunk `index` inside the target object.
    ///
    /// # Errors
    ///
    /// `ChunkOutOfRange` when `index` is not below [`Self::chunk_count`].
    pub fn chunk_span(&self, index: usize) -> Result<(u64, u64), StorageError> {
        let num = self.chunk_count();
        if index >= num {
            return Err(StorageError::ChunkOutOfRange {
                index: i64::try_from(index).unwrap_or(i64::MAX),
                num,
            });
        }
        let chunk_size = if self.chunk_size == 0 {
            self.size
        } else {
            self.chunk_size
        };
        let offset = chunk_size * index as u64;
        Ok((offset, chunk_size.min(self.size - offset)))
    }

    /// Whether `index` is the final chunk.
    #[must_use]
    pub fn is_last_chunk(&self, index: usize) -> bool {
        index + 1 == self.chunk_count()
    }

    /// Whether the session is past its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What a client needs to push bytes for an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCredential {
    /// Session the credential belongs to.
    pub session_id: UploadSessionId,
    /// One URL per chunk, or a single URL taking every chunk by index.
    pub upload_urls: Vec<String>,
    /// URL to call once every chunk is sent, if the backend needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_url: Option<String>,
    /// Chunk size the client must use.
    pub chunk_size: u64,
    /// When the URLs stop working.
    pub expires_at: DateTime<Utc>,
    /// Backend upload identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upload_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_chunk_span() {
        let session = UploadSession::new(PolicyId::new(), "a", 2_560_000, 1_000_000, Utc::now());
        assert_eq!(session.chunk_span(0).unwrap(), (0, 1_000_000));
        assert_eq!(session.chunk_span(2).unwrap(), (2_000_000, 560_000));
        assert!(session.is_last_chunk(2));
        assert!(!session.is_last_chunk(1));
        assert!(matches!(
            session.chunk_span(3),
            Err(StorageError::ChunkOutOfRange { index: 3, num: 3 })
        ));

        let empty = UploadSession::new(PolicyId::new(), "a", 0, 4, Utc::now());
        assert_eq!(empty.chunk_span(0).unwrap(), (0, 0));
    }

    #[rstest]
    #[case(0, 100, 1)]
    #[case(100, 0, 1)]
    #[case(100, 100, 1)]
    #[case(101, 100, 2)]
    #[case(2_560_000, 1_000_000, 3)]
    fn test_chunk_count(#[case] size: u64, #[case] chunk: u64, #[case] expected: usize) {
        let session = UploadSession::new(PolicyId::new(), "a", size, chunk, Utc::now());
        assert_eq!(session.chunk_count(), expected);
    }

    #[test]
    fn test_session_roundtrips_through_json() {
        let session = UploadSession::new(PolicyId::new(), "dir/a.bin", 10, 4, Utc::now())
            .with_overwrite(true)
            .with_callback("https://site/cb");
        let json = serde_json::to_string(&session).unwrap();
        let back: UploadSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let session = UploadSession::new(PolicyId::new(), "a", 1, 1, now);
        assert!(session.is_expired(now));
        assert!(!session.is_expired(now - chrono::Duration::seconds(1)));
    }
}
