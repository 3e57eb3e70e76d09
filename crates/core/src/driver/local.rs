//! Local disk backend.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_shared::PolicyConfig;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{
    Capabilities, CapabilityFlags, Driver, DriverContext, MediaMeta, PhysicalObject, SourceArgs,
};
use crate::error::StorageError;
use crate::request::{UploadProps, UploadRequest};
use crate::upload::{UploadCredential, UploadSession};

/// Files under a root directory on this machine.
///
/// Content is always served by the application, so `source` and `thumb` are
/// not offered. Client uploads are relayed chunk by chunk through the site.
#[derive(Debug)]
pub struct LocalDriver {
    root: PathBuf,
    policy: PolicyConfig,
    ctx: DriverContext,
    capabilities: Capabilities,
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, policy: PolicyConfig, ctx: DriverContext) -> Self {
        Self {
            root: root.into(),
            policy,
            ctx,
            capabilities: Capabilities::new(
                CapabilityFlags::PROXY_REQUIRED | CapabilityFlags::LOCAL_READ,
            ),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage key to a path under the root, rejecting traversal.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn relay_url(&self, path: &str, expire: DateTime<Utc>) -> Result<String, StorageError> {
        let signed = self.ctx.signer.sign_uri(path, Some(expire))?;
        Ok(format!("{}{signed}", self.ctx.site_url))
    }

    async fn write(&self, dst: &Path, file: &mut UploadRequest) -> Result<(), StorageError> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }

        let offset = file.props.offset;
        let mut out = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(offset == 0)
            .open(dst)
            .await?;
        if offset > 0 {
            out.seek(std::io::SeekFrom::Start(offset)).await?;
        }

        let size = file.props.size;
        let cancel = file.cancellation().clone();
        let copied = {
            let mut src = file.reader_mut().take(size);
            tokio::select! {
                () = cancel.cancelled() => return Err(StorageError::Cancelled),
                copied = tokio::io::copy(&mut src, &mut out) => copied?,
            }
        };
        out.flush().await?;

        if copied != size {
            return Err(StorageError::size_mismatch(size, copied));
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for LocalDriver {
    async fn put(&self, mut file: UploadRequest) -> Result<(), StorageError> {
        let dst = self.resolve(&file.props.path)?;
        let existed = fs::try_exists(&dst).await?;
        if existed && !file.props.overwrite {
            return Err(StorageError::object_existed(&file.props.path));
        }

        if let Err(err) = self.write(&dst, &mut file).await {
            if !existed {
                if let Err(cleanup) = fs::remove_file(&dst).await {
                    debug!(path = %dst.display(), error = %cleanup, "Failed to clean up partial file");
                }
            }
            return Err(err);
        }

        debug!(path = %file.props.path, size = file.props.size, offset = file.props.offset, "Stored local file");
        Ok(())
    }

    async fn delete(&self, files: &[String]) -> Result<(), StorageError> {
        let mut failed = Vec::new();
        let mut last_error = String::new();

        for key in files {
            let result = match self.resolve(key) {
                Ok(path) => fs::remove_file(&path).await.map_err(StorageError::from),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(path = %key, error = %err, "Failed to delete local file");
                    last_error = err.to_string();
                    failed.push(key.clone());
                }
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

    async fn open(&self, path: &str) -> Result<tokio::fs::File, StorageError> {
        let resolved = self.resolve(path)?;
        fs::File::open(&resolved).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::not_found(path)
            } else {
                e.into()
            }
        })
    }

    fn local_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        self.resolve(path)
    }

    async fn thumb(
        &self,
        _path: &str,
        _ext: &str,
        _expire: Option<DateTime<Utc>>,
    ) -> Result<String, StorageError> {
        Err(StorageError::Unsupported("thumb"))
    }

    async fn source(&self, _path: &str, _args: &SourceArgs) -> Result<String, StorageError> {
        Err(StorageError::Unsupported("source"))
    }

    async fn token(
        &self,
        session: &mut UploadSession,
        file: &UploadProps,
    ) -> Result<UploadCredential, StorageError> {
        let dst = self.resolve(&file.path)?;
        if !file.overwrite && fs::try_exists(&dst).await? {
            return Err(StorageError::object_existed(&file.path));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::File::create(&dst).await?;

        session.chunk_size = self.ctx.chunk_size(self.policy.chunk_size);
        let base = format!("/api/v1/file/upload/{}", session.id);
        let upload_urls = (0..session.chunk_count())
            .map(|index| self.relay_url(&format!("{base}/{index}"), session.expires_at))
            .collect::<Result<Vec<_>, _>>()?;
        let complete_url = self.relay_url(&format!("{base}/complete"), session.expires_at)?;

        Ok(UploadCredential {
            session_id: session.id,
            upload_urls,
            complete_url: Some(complete_url),
            chunk_size: session.chunk_size,
            expires_at: session.expires_at,
            upload_id: String::new(),
        })
    }

    async fn cancel_token(&self, session: &UploadSession) -> Result<(), StorageError> {
        self.delete(std::slice::from_ref(&session.path)).await
    }

    async fn complete_upload(&self, session: &UploadSession) -> Result<(), StorageError> {
        let meta = fs::metadata(self.resolve(&session.path)?).await?;
        if meta.len() != session.size {
            return Err(StorageError::size_mismatch(session.size, meta.len()));
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
        let base = self.resolve(path)?;
        let mut objects = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let full = entry.path();
                if meta.is_dir() && recursive {
                    pending.push(full.clone());
                }

                objects.push(PhysicalObject {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    source: to_slash(full.strip_prefix(&self.root).unwrap_or(&full)),
                    relative_path: to_slash(full.strip_prefix(&base).unwrap_or(&full)),
                    size: if meta.is_dir() { 0 } else { meta.len() },
                    is_dir: meta.is_dir(),
                    last_modify: meta.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }

        objects.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(objects)
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
