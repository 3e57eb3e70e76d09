//! Storage policy hosted on a slave node.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_shared::{PolicyConfig, Signer};

use super::{
    Capabilities, CapabilityFlags, Driver, DriverContext, MediaMeta, PhysicalObject, SourceArgs,
    encode_segment,
};
use crate::error::StorageError;
use crate::remote::RemoteClient;
use crate::remote::protocol::{CODE_NOT_FOUND, SLAVE_API_PREFIX};
use crate::request::{UploadProps, UploadRequest};
use crate::upload::{UploadCredential, UploadSession};

/// Delegates every operation to a slave node over the signed protocol.
#[derive(Debug)]
pub struct RemoteDriver {
    client: RemoteClient,
    server: String,
    signer: Signer,
    chunk_size: u64,
    capabilities: Capabilities,
}

impl RemoteDriver {
    /// Create a driver for the node at `server`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `server` is not a valid URL.
    pub fn new(
        server: &str,
        node_id: &str,
        secret: &str,
        policy: &PolicyConfig,
        ctx: DriverContext,
    ) -> Result<Self, StorageError> {
        let chunk_size = ctx.chunk_size(policy.chunk_size);
        let client = RemoteClient::new(server, node_id, secret, policy.id, chunk_size, ctx)?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            signer: Signer::new(secret),
            chunk_size,
            capabilities: Capabilities::new(CapabilityFlags::empty()),
        })
    }

    /// Protocol client.
    #[must_use]
    pub fn client(&self) -> &RemoteClient {
        &self.client
    }

    fn signed_url(
        &self,
        route: &str,
        expire: Option<DateTime<Utc>>,
    ) -> Result<String, StorageError> {
        let signed = self.signer.sign_uri(route, expire)?;
        Ok(format!("{}{signed}", self.server))
    }
}

#[async_trait]
impl Driver for RemoteDriver {
    async fn put(&self, file: UploadRequest) -> Result<(), StorageError> {
        self.client.upload(file).await
    }

    async fn delete(&self, files: &[String]) -> Result<(), StorageError> {
        self.client.delete_files(files).await
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
        let name = if args.display_name.is_empty() {
            path.rsplit('/').next().unwrap_or(path)
        } else {
            args.display_name.as_str()
        };
        let mut route = format!(
            "{SLAVE_API_PREFIX}/file/content/{}/{}/{}",
            base64_url::encode(path),
            args.speed,
            encode_segment(name)
        );
        if args.is_download {
            route.push_str("?download=true");
        }

        let expire = self.capabilities.clamp_expire(args.expire, Utc::now());
        self.signed_url(&route, expire)
    }

    async fn token(
        &self,
        session: &mut UploadSession,
        file: &UploadProps,
    ) -> Result<UploadCredential, StorageError> {
        session.chunk_size = self.chunk_size;
        self.client
            .create_upload_session(session, file.overwrite)
            .await?;

        let upload_urls = (0..session.chunk_count())
            .map(|index| {
                self.signed_url(
                    &format!("{SLAVE_API_PREFIX}/upload/{}?chunk={index}", session.id),
                    Some(session.expires_at),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UploadCredential {
            session_id: session.id,
            upload_urls,
            complete_url: None,
            chunk_size: session.chunk_size,
            expires_at: session.expires_at,
            upload_id: String::new(),
        })
    }

    async fn cancel_token(&self, session: &UploadSession) -> Result<(), StorageError> {
        self.client.delete_upload_session(session.id).await
    }

    async fn complete_upload(&self, session: &UploadSession) -> Result<(), StorageError> {
        // A live node session still waits for chunks.
        match self.client.upload_status(session.id).await {
            Ok(progress) => {
                return Err(StorageError::operation(format!(
                    "upload incomplete: node stored {} of {} chunk(s)",
                    progress.received, progress.total
                )));
            }
            Err(StorageError::Remote { code, .. }) if code == CODE_NOT_FOUND => {}
            Err(e) => return Err(e),
        }

        let object = self.client.stat(&session.path).await?;
        if object.size != session.size {
            return Err(StorageError::size_mismatch(session.size, object.size));
        }
        Ok(())
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn media_meta(&self, path: &str, ext: &str) -> Result<Vec<MediaMeta>, StorageError> {
        self.client.media_meta(path, ext).await
    }

    async fn list(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<PhysicalObject>, StorageError> {
        self.client.list(path, recursive).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nimbus_shared::signing::split_signature;
    use nimbus_shared::types::PolicyId;
    use nimbus_shared::{ChunkConfig, StorageProvider};

    use super::*;

    fn driver() -> RemoteDriver {
        let policy = PolicyConfig::new(
            PolicyId::new(),
            "node",
            StorageProvider::remote("http://node:5212/", "node-1", "node-secret"),
        );
        let ctx = DriverContext {
            site_id: "site".into(),
            site_url: "https://cloud.example.com".into(),
            signer: Signer::new("site-secret"),
            chunk: ChunkConfig::default(),
            request_ttl: Duration::from_secs(60),
        };
        RemoteDriver::new("http://node:5212/", "node-1", "node-secret", &policy, ctx).unwrap()
    }

    #[tokio::test]
    async fn test_complete_upload_fails_when_node_is_unreachable() {
        let policy = PolicyConfig::new(
            PolicyId::new(),
            "node",
            StorageProvider::remote("http://127.0.0.1:9", "node-1", "node-secret"),
        );
        let ctx = DriverContext {
            site_id: "site".into(),
            site_url: "https://cloud.example.com".into(),
            signer: Signer::new("site-secret"),
            chunk: ChunkConfig::default(),
            request_ttl: Duration::from_secs(60),
        };
        let driver =
            RemoteDriver::new("http://127.0.0.1:9", "node-1", "node-secret", &policy, ctx).unwrap();
        let session = UploadSession::new(
            policy.id,
            "a.bin",
            10,
            4,
            Utc::now() + chrono::Duration::hours(1),
        );

        assert!(driver.complete_upload(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_source_signs_slave_content_url() {
        let driver = driver();
        let args = SourceArgs {
            is_download: true,
            speed: 1024,
            display_name: "my file.txt".into(),
            ..SourceArgs::default()
        };

        let url = driver.source("dir/a.txt", &args).await.unwrap();
        let path_and_query = url.strip_prefix("http://node:5212").unwrap();
        let (path, query) = path_and_query.split_once('?').unwrap();
        let (rest, sign) = split_signature(query);

        assert_eq!(
            path,
            format!(
                "/api/v1/slave/file/content/{}/1024/my%20file.txt",
                base64_url::encode("dir/a.txt")
            )
        );
        assert_eq!(rest, "download=true");
        Signer::new("node-secret")
            .verify(&format!("{path}?{rest}"), &sign.unwrap())
            .unwrap();
    }
}
