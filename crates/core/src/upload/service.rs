//! Upload orchestration: session creation, chunk relay, completion, and cancellation.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use nimbus_shared::types::{PolicyId, UploadSessionId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sentinel::SentinelTasks;
use super::session::{UploadCredential, UploadSession};
use super::store::SessionStore;
use crate::driver::{CapabilityFlags, DriverContext, DriverRegistry};
use crate::entity::{Entity, EntityRepository};
use crate::error::StorageError;
use crate::request::{UploadProps, UploadRequest};

/// Default session lifetime in seconds.
const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 3600;

/// Input for creating an upload session.
#[derive(Debug, Clone)]
pub struct CreateUploadInput {
    /// Target policy.
    pub policy_id: PolicyId,
    /// Target path inside the policy.
    pub path: String,
    /// Announced size.
    pub size: u64,
    /// Announced MIME type.
    pub mime_type: Option<String>,
    /// Replace an existing object.
    pub overwrite: bool,
    /// Session lifetime in seconds; `None` uses the default.
    pub ttl_secs: Option<i64>,
}

/// Upload service coordinating drivers, sessions, and entities.
pub struct UploadService<R: EntityRepository> {
    registry: Arc<DriverRegistry>,
    repo: Arc<R>,
    sessions: SessionStore,
    sentinels: SentinelTasks,
    ctx: DriverContext,
}

impl<R: EntityRepository> std::fmt::Debug for UploadService<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadService")
            .field("sessions", &self.sessions)
            .field("sentinels", &self.sentinels.armed())
            .finish_non_exhaustive()
    }
}

impl<R: EntityRepository> UploadService<R> {
    /// Create a new upload service.
    #[must_use]
    pub fn new(registry: Arc<DriverRegistry>, repo: Arc<R>, ctx: DriverContext) -> Self {
        Self {
            registry,
            repo,
            sessions: SessionStore::new(),
            sentinels: SentinelTasks::new(),
            ctx,
        }
    }

    /// Live session by id.
    #[must_use]
    pub fn session(&self, id: &UploadSessionId) -> Option<UploadSession> {
        self.sessions.get(id)
    }

    /// Armed sentinel tasks.
    #[must_use]
    pub fn sentinels(&self) -> &SentinelTasks {
        &self.sentinels
    }

    /// Prepare the policy's backend for an upload and return the client credential.
    ///
    /// Backends that need one get a sentinel task that cleans up after expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy is unknown or the backend refuses the upload.
    pub async fn create_session(
        &self,
        input: CreateUploadInput,
    ) -> Result<UploadCredential, StorageError> {
        let handle = self.registry.get(&input.policy_id)?;
        let ttl = input.ttl_secs.unwrap_or(DEFAULT_SESSION_TTL_SECS);
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl);

        let mut session = UploadSession::new(
            input.policy_id,
            input.path.clone(),
            input.size,
            self.ctx.chunk_size(handle.policy.chunk_size),
            expires_at,
        )
        .with_mime_type(input.mime_type.clone())
        .with_overwrite(input.overwrite);
        let complete_url = self.complete_url(&session)?;
        session.callback.clone_from(&complete_url);

        let mut props = UploadProps::new(input.path, input.size)
            .with_overwrite(input.overwrite)
            .with_expire(expires_at);
        props.mime_type = input.mime_type;

        let mut credential = handle.driver.token(&mut session, &props).await?;
        if credential.complete_url.is_none() {
            credential.complete_url = Some(complete_url);
        }

        if handle
            .driver
            .capabilities()
            .has(CapabilityFlags::UPLOAD_SENTINEL_REQUIRED)
        {
            session.sentinel_task = Some(
                self.sentinels
                    .arm(Arc::clone(&handle.driver), session.clone()),
            );
        }

        info!(
            session_id = %session.id,
            policy_id = %session.policy_id,
            path = %session.path,
            size = session.size,
            chunks = session.chunk_count(),
            "Upload session created"
        );
        self.sessions.insert(session);
        Ok(credential)
    }

    /// Write one relayed chunk into the session's placeholder.
    ///
    /// # Errors
    ///
    /// `SessionNotFound`, `ChunkOutOfRange`, `Unsupported` for backends that take
    /// uploads directly, or the driver's write error.
    pub async fn upload_chunk<S>(
        &self,
        session_id: &UploadSessionId,
        index: usize,
        body: S,
        cancel: CancellationToken,
    ) -> Result<(), StorageError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
    {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| StorageError::SessionNotFound(session_id.to_string()))?;
        let handle = self.registry.get(&session.policy_id)?;
        if !handle
            .driver
            .capabilities()
            .has(CapabilityFlags::LOCAL_READ)
        {
            return Err(StorageError::Unsupported("chunk relay"));
        }

        let (offset, length) = session.chunk_span(index)?;

        let mut props = UploadProps::new(session.path.clone(), length)
            .with_offset(offset)
            .with_overwrite(true)
            .with_expire(session.expires_at);
        props.mime_type.clone_from(&session.mime_type);

        let request = UploadRequest::from_stream(props, body).with_cancellation(cancel);
        handle
            .driver
            .put(request)
            .await
            .map_err(|e| StorageError::chunk(i64::try_from(index).unwrap_or(i64::MAX), e))?;

        debug!(session_id = %session.id, chunk = index, offset, length, "Chunk relayed");
        Ok(())
    }

    /// Verify the uploaded object, register its entity, and end the session.
    ///
    /// # Errors
    ///
    /// `SessionNotFound`, or the driver's verification error (the session stays
    /// open so the client may retry before it expires).
    pub async fn complete(&self, session_id: &UploadSessionId) -> Result<Entity, StorageError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| StorageError::SessionNotFound(session_id.to_string()))?;
        let handle = self.registry.get(&session.policy_id)?;

        handle.driver.complete_upload(&session).await?;

        if let Some(task) = &session.sentinel_task {
            self.sentinels.disarm(task);
        }
        self.sessions.remove(session_id);

        let entity = self
            .repo
            .create(Entity::new(session.policy_id, session.path.clone(), session.size))
            .await?;
        info!(session_id = %session.id, entity_id = %entity.id, size = entity.size, "Upload completed");
        Ok(entity)
    }

    /// Abort an upload and release backend state.
    ///
    /// # Errors
    ///
    /// `SessionNotFound`, or the driver's cancellation error.
    pub async fn cancel(&self, session_id: &UploadSessionId) -> Result<(), StorageError> {
        let session = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| StorageError::SessionNotFound(session_id.to_string()))?;

        if let Some(task) = &session.sentinel_task {
            self.sentinels.disarm(task);
        }

        let handle = self.registry.get(&session.policy_id)?;
        if let Err(err) = handle.driver.cancel_token(&session).await {
            warn!(session_id = %session.id, error = %err, "Failed to release cancelled upload");
            return Err(err);
        }
        info!(session_id = %session.id, "Upload cancelled");
        Ok(())
    }

    fn complete_url(&self, session: &UploadSession) -> Result<String, StorageError> {
        let path = format!("/api/v1/file/upload/{}/complete", session.id);
        let signed = self.ctx.signer.sign_uri(&path, Some(session.expires_at))?;
        Ok(format!("{}{signed}", self.ctx.site_url))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;
    use nimbus_shared::{ChunkConfig, PolicyConfig, Signer, StorageProvider};

    use super::*;
    use crate::driver::{
        Capabilities, Driver, MediaMeta, ObjectDriver, PhysicalObject, SourceArgs, build_driver,
    };
    use crate::entity::InMemoryEntityRepository;

    fn ctx() -> DriverContext {
        DriverContext {
            site_id: "site".into(),
            site_url: "https://cloud.example.com".into(),
            signer: Signer::new("secret"),
            chunk: ChunkConfig::default(),
            request_ttl: Duration::from_secs(60),
        }
    }

    fn service(
        root: &Path,
    ) -> (
        UploadService<InMemoryEntityRepository>,
        PolicyId,
        Arc<InMemoryEntityRepository>,
    ) {
        let policy = PolicyConfig::new(PolicyId::new(), "disk", StorageProvider::local(root))
            .with_chunk_size(4);
        let id = policy.id;
        let mut registry = DriverRegistry::new();
        registry.insert(policy.clone(), build_driver(&policy, ctx()).unwrap());
        let repo = Arc::new(InMemoryEntityRepository::new());
        (
            UploadService::new(Arc::new(registry), Arc::clone(&repo), ctx()),
            id,
            repo,
        )
    }

    fn input(policy_id: PolicyId, size: u64) -> CreateUploadInput {
        CreateUploadInput {
            policy_id,
            path: "up/data.bin".into(),
            size,
            mime_type: None,
            overwrite: false,
            ttl_secs: None,
        }
    }

    fn body(data: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static {
        futures::stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(data))])
    }

    #[tokio::test]
    async fn test_relay_then_complete_registers_entity() {
        let dir = tempfile::tempdir().unwrap();
        let (service, policy_id, repo) = service(dir.path());

        let credential = service.create_session(input(policy_id, 10)).await.unwrap();
        assert_eq!(credential.upload_urls.len(), 3);
        assert!(credential.complete_url.is_some());

        let id = credential.session_id;
        for (index, part) in [&b"0123"[..], b"4567", b"89"].into_iter().enumerate() {
            service
                .upload_chunk(&id, index, body(part), CancellationToken::new())
                .await
                .unwrap();
        }

        let entity = service.complete(&id).await.unwrap();
        assert_eq!(entity.size, 10);
        assert_eq!(repo.len(), 1);
        assert!(service.session(&id).is_none());
        assert_eq!(
            std::fs::read(dir.path().join("up/data.bin")).unwrap(),
            b"0123456789"
        );
    }

    #[tokio::test]
    async fn test_incomplete_upload_fails_size_check() {
        let dir = tempfile::tempdir().unwrap();
        let (service, policy_id, repo) = service(dir.path());

        let id = service
            .create_session(input(policy_id, 10))
            .await
            .unwrap()
            .session_id;
        service
            .upload_chunk(&id, 0, body(b"0123"), CancellationToken::new())
            .await
            .unwrap();

        let err = service.complete(&id).await.unwrap_err();
        assert!(matches!(err, StorageError::SizeMismatch { expected: 10, actual: 4 }));
        assert!(repo.is_empty());
        assert!(service.session(&id).is_some());
    }

    #[tokio::test]
    async fn test_chunk_index_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let (service, policy_id, _) = service(dir.path());
        let id = service
            .create_session(input(policy_id, 10))
            .await
            .unwrap()
            .session_id;

        let err = service
            .upload_chunk(&id, 3, body(b"x"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ChunkOutOfRange { index: 3, num: 3 }));
    }

    #[tokio::test]
    async fn test_cancel_removes_placeholder_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let (service, policy_id, _) = service(dir.path());
        let id = service
            .create_session(input(policy_id, 10))
            .await
            .unwrap()
            .session_id;
        assert!(dir.path().join("up/data.bin").exists());

        service.cancel(&id).await.unwrap();

        assert!(!dir.path().join("up/data.bin").exists());
        assert!(matches!(
            service.cancel(&id).await,
            Err(StorageError::SessionNotFound(_))
        ));
    }

    /// Object store whose clients upload the whole object straight to the backend.
    #[derive(Debug)]
    struct DirectObjectStore {
        inner: ObjectDriver,
    }

    #[async_trait]
    impl Driver for DirectObjectStore {
        async fn put(&self, file: UploadRequest) -> Result<(), StorageError> {
            self.inner.put(file).await
        }

        async fn delete(&self, files: &[String]) -> Result<(), StorageError> {
            self.inner.delete(files).await
        }

        async fn thumb(
            &self,
            path: &str,
            ext: &str,
            expire: Option<chrono::DateTime<Utc>>,
        ) -> Result<String, StorageError> {
            self.inner.thumb(path, ext, expire).await
        }

        async fn source(&self, path: &str, args: &SourceArgs) -> Result<String, StorageError> {
            self.inner.source(path, args).await
        }

        // The in-memory service cannot presign, so hand out a plain backend URL.
        async fn token(
            &self,
            session: &mut UploadSession,
            _file: &UploadProps,
        ) -> Result<UploadCredential, StorageError> {
            session.chunk_size = 0;
            Ok(UploadCredential {
                session_id: session.id,
                upload_urls: vec![format!("memory:///{}", session.path)],
                complete_url: None,
                chunk_size: session.size,
                expires_at: session.expires_at,
                upload_id: String::new(),
            })
        }

        async fn cancel_token(&self, session: &UploadSession) -> Result<(), StorageError> {
            self.inner.cancel_token(session).await
        }

        async fn complete_upload(&self, session: &UploadSession) -> Result<(), StorageError> {
            self.inner.complete_upload(session).await
        }

        fn capabilities(&self) -> &Capabilities {
            self.inner.capabilities()
        }

        async fn media_meta(&self, path: &str, ext: &str) -> Result<Vec<MediaMeta>, StorageError> {
            self.inner.media_meta(path, ext).await
        }

        async fn list(
            &self,
            path: &str,
            recursive: bool,
        ) -> Result<Vec<PhysicalObject>, StorageError> {
            self.inner.list(path, recursive).await
        }
    }

    fn object_service() -> (
        UploadService<InMemoryEntityRepository>,
        PolicyId,
        Arc<DirectObjectStore>,
    ) {
        let policy = PolicyConfig::new(PolicyId::new(), "memory", StorageProvider::Memory);
        let id = policy.id;
        let store = Arc::new(DirectObjectStore {
            inner: ObjectDriver::from_policy(policy.clone(), ctx()).unwrap(),
        });
        let mut registry = DriverRegistry::new();
        registry.insert(policy, Arc::clone(&store) as Arc<dyn Driver>);
        let repo = Arc::new(InMemoryEntityRepository::new());
        (
            UploadService::new(Arc::new(registry), repo, ctx()),
            id,
            store,
        )
    }

    async fn client_writes(store: &DirectObjectStore, data: &'static [u8]) {
        let props = UploadProps::new("up/data.bin", data.len() as u64).with_overwrite(true);
        store
            .put(UploadRequest::from_bytes(props, data))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sentinel_backed_upload_verifies_size_before_completing() {
        let (service, policy_id, store) = object_service();

        let id = service
            .create_session(input(policy_id, 10))
            .await
            .unwrap()
            .session_id;
        assert_eq!(service.sentinels().armed(), 1);

        client_writes(&store, b"0123").await;
        let err = service.complete(&id).await.unwrap_err();
        assert!(matches!(err, StorageError::SizeMismatch { expected: 10, actual: 4 }));
        assert!(service.session(&id).is_some());
        assert_eq!(service.sentinels().armed(), 1);

        client_writes(&store, b"0123456789").await;
        let entity = service.complete(&id).await.unwrap();
        assert_eq!(entity.size, 10);
        assert!(service.session(&id).is_none());
        assert_eq!(service.sentinels().armed(), 0);
    }

    #[tokio::test]
    async fn test_cancel_disarms_sentinel() {
        let (service, policy_id, store) = object_service();

        let id = service
            .create_session(input(policy_id, 4))
            .await
            .unwrap()
            .session_id;
        client_writes(&store, b"0123").await;
        assert_eq!(service.sentinels().armed(), 1);

        service.cancel(&id).await.unwrap();
        assert_eq!(service.sentinels().armed(), 0);
        assert!(store.inner.operator().stat("up/data.bin").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _, _) = service(dir.path());

        let err = service.complete(&UploadSessionId::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound(_)));
    }
}
