//! Object storage backend using Apache OpenDAL.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Apache OpenDAL                             │
//! │                   (Unified Storage API)                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ op.writer(key) per chunk   │ op.presign_read_with(key, ttl)     │
//! │ op.stat(key)               │ op.presign_write(key, ttl)         │
//! │ op.delete(key)             │ op.list_with(dir).recursive(..)    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_shared::{PolicyConfig, StorageProvider};
use opendal::{ErrorKind, Operator, services};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::{
    Capabilities, CapabilityFlags, Driver, DriverContext, MediaMeta, PhysicalObject, SourceArgs,
};
use crate::chunk::{ChunkGroup, ChunkInfo, ChunkProcessor};
use crate::disposition;
use crate::error::StorageError;
use crate::request::{UploadProps, UploadRequest};
use crate::upload::{UploadCredential, UploadSession};

/// Longest presigned URL lifetime accepted by S3 and Azure.
const MAX_PRESIGN_EXPIRE: Duration = Duration::from_secs(7 * 24 * 3600);

/// S3-compatible, Azure Blob, or in-memory object storage.
#[derive(Debug)]
pub struct ObjectDriver {
    operator: Operator,
    policy: PolicyConfig,
    ctx: DriverContext,
    capabilities: Capabilities,
}

impl ObjectDriver {
    /// Create a driver from a policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is not an object store or cannot be initialized.
    pub fn from_policy(policy: PolicyConfig, ctx: DriverContext) -> Result<Self, StorageError> {
        let operator = Self::create_operator(&policy.provider)?;
        Ok(Self::with_operator(operator, policy, ctx))
    }

    /// Create a driver over an existing operator.
    #[must_use]
    pub fn with_operator(operator: Operator, policy: PolicyConfig, ctx: DriverContext) -> Self {
        Self {
            operator,
            policy,
            ctx,
            capabilities: Capabilities::new(CapabilityFlags::UPLOAD_SENTINEL_REQUIRED)
                .with_source_expire(Duration::from_secs(1), MAX_PRESIGN_EXPIRE),
        }
    }

    /// Create OpenDAL operator from provider config.
    fn create_operator(provider: &StorageProvider) -> Result<Operator, StorageError> {
        match provider {
            StorageProvider::S3 {
                endpoint,
                bucket,
                access_key_id,
                secret_access_key,
                region,
            } => {
                let builder = services::S3::default()
                    .endpoint(endpoint)
                    .bucket(bucket)
                    .access_key_id(access_key_id)
                    .secret_access_key(secret_access_key)
                    .region(region);

                Ok(Operator::new(builder)
                    .map_err(|e| StorageError::configuration(e.to_string()))?
                    .finish())
            }
            StorageProvider::AzureBlob {
                account,
                access_key,
                container,
            } => {
                let builder = services::Azblob::default()
                    .account_name(account)
                    .account_key(access_key)
                    .container(container);

                Ok(Operator::new(builder)
                    .map_err(|e| StorageError::configuration(e.to_string()))?
                    .finish())
            }
            StorageProvider::Memory => Ok(Operator::new(services::Memory::default())
                .map_err(|e| StorageError::configuration(e.to_string()))?
                .finish()),
            other => Err(StorageError::configuration(format!(
                "{} is not an object storage provider",
                other.name()
            ))),
        }
    }

    /// Underlying operator.
    #[must_use]
    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.operator.stat(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_chunks(
        &self,
        file: &mut UploadRequest,
        writer: &mut opendal::Writer,
    ) -> Result<(), StorageError> {
        let chunk_size = self.ctx.chunk_size(self.policy.chunk_size);
        let mut group = ChunkGroup::new(
            file,
            chunk_size,
            Box::new(self.ctx.backoff()),
            self.ctx.chunk.buffer,
            &self.ctx.chunk.temp_dir,
        );
        let mut processor = WriterProcessor { writer };

        while group.next() {
            group.process(&mut processor).await?;
        }
        Ok(())
    }
}

/// Appends each chunk to an OpenDAL writer.
struct WriterProcessor<'w> {
    writer: &'w mut opendal::Writer,
}

#[async_trait]
impl ChunkProcessor for WriterProcessor<'_> {
    async fn process(
        &mut self,
        chunk: &ChunkInfo,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        if buf.len() as u64 != chunk.length {
            return Err(StorageError::size_mismatch(chunk.length, buf.len() as u64));
        }
        self.writer.write(buf).await?;
        Ok(())
    }
}

/// Storage key for a path: no leading slash, no traversal.
fn normalize_key(path: &str) -> Result<String, StorageError> {
    let key = path.trim_start_matches('/');
    if key.split('/').any(|segment| segment == "..") {
        return Err(StorageError::InvalidKey(path.to_string()));
    }
    Ok(key.to_string())
}

fn ttl_until(expire: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (expire - now).to_std().unwrap_or(Duration::from_secs(1))
}

#[async_trait]
impl Driver for ObjectDriver {
    async fn put(&self, mut file: UploadRequest) -> Result<(), StorageError> {
        let key = normalize_key(&file.props.path)?;
        if !file.props.overwrite && self.exists(&key).await? {
            return Err(StorageError::object_existed(&key));
        }

        let mut writer = match file.props.mime_type.clone() {
            Some(content_type) => {
                self.operator
                    .writer_with(&key)
                    .content_type(&content_type)
                    .await?
            }
            None => self.operator.writer(&key).await?,
        };

        if let Err(err) = self.write_chunks(&mut file, &mut writer).await {
            if let Err(abort) = writer.abort().await {
                warn!(key = %key, error = %abort, "Failed to abort object writer");
            }
            return Err(err);
        }
        writer.close().await?;

        debug!(key = %key, size = file.props.size, "Stored object");
        Ok(())
    }

    async fn delete(&self, files: &[String]) -> Result<(), StorageError> {
        let mut failed = Vec::new();
        let mut last_error = String::new();

        for path in files {
            let result = match normalize_key(path) {
                Ok(key) => self.operator.delete(&key).await.map_err(StorageError::from),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(key = %path, error = %err, "Failed to delete object");
                last_error = err.to_string();
                failed.push(path.clone());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(StorageError::PartialDelete {
                failed,
                message: last_error,
            })
        }
    }

    async fn thumb(
        &self,
        _path: &str,
        _ext: &str,
        _expire: Option<DateTime<Utc>>,
    ) -> Result<String, StorageError> {
        Err(StorageError::Unsupported("thumb"))
    }

    async fn source(&self, path: &str, args: &SourceArgs) -> Result<String, StorageError> {
        let key = normalize_key(path)?;
        let now = Utc::now();
        let expire = self
            .capabilities
            .clamp_expire(args.expire, now)
            .unwrap_or(now + chrono::Duration::seconds(3600));

        let mut presign = self.operator.presign_read_with(&key, ttl_until(expire, now));
        if args.is_download {
            presign = presign.override_content_disposition(&disposition::attachment(
                &args.display_name,
            ));
        }
        let presigned = presign.await?;
        Ok(presigned.uri().to_string())
    }

    async fn token(
        &self,
        session: &mut UploadSession,
        file: &UploadProps,
    ) -> Result<UploadCredential, StorageError> {
        let key = normalize_key(&file.path)?;
        if !file.overwrite && self.exists(&key).await? {
            return Err(StorageError::object_existed(&key));
        }

        let presigned = self
            .operator
            .presign_write(&key, ttl_until(session.expires_at, Utc::now()))
            .await?;

        // One presigned PUT carries the whole object.
        session.chunk_size = 0;
        Ok(UploadCredential {
            session_id: session.id,
            upload_urls: vec![presigned.uri().to_string()],
            complete_url: None,
            chunk_size: session.size,
            expires_at: session.expires_at,
            upload_id: session.upload_id.clone(),
        })
    }

    async fn cancel_token(&self, session: &UploadSession) -> Result<(), StorageError> {
        let key = normalize_key(&session.path)?;
        self.operator.delete(&key).await?;
        Ok(())
    }

    async fn complete_upload(&self, session: &UploadSession) -> Result<(), StorageError> {
        let key = normalize_key(&session.path)?;
        let meta = self.operator.stat(&key).await?;
        if meta.content_length() != session.size {
            return Err(StorageError::size_mismatch(
                session.size,
                meta.content_length(),
            ));
        }
        Ok(())
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn media_meta(&self, _path: &str, _ext: &str) -> Result<Vec<MediaMeta>, StorageError> {
        Err(StorageError::Unsupported("media_meta"))
    }

    async fn list(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<PhysicalObject>, StorageError> {
        let key = normalize_key(path)?;
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key.trim_end_matches('/'))
        };
        let dir = if prefix.is_empty() { "/" } else { prefix.as_str() };

        let entries = self.operator.list_with(dir).recursive(recursive).await?;
        let mut objects = Vec::with_capacity(entries.len());
        for entry in entries {
            let source = entry.path().trim_end_matches('/').to_string();
            let relative = source.strip_prefix(&prefix).unwrap_or(&source).to_string();
            if relative.is_empty() {
                continue;
            }

            let meta = entry.metadata();
            objects.push(PhysicalObject {
                name: entry.name().trim_end_matches('/').to_string(),
                source,
                relative_path: relative,
                size: if meta.is_dir() { 0 } else { meta.content_length() },
                is_dir: meta.is_dir(),
                last_modify: None,
            });
        }

        objects.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(objects)
    }
}
