//! HTTP client for a slave node.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use nimbus_shared::Signer;
use nimbus_shared::signing::signing_target;
use nimbus_shared::types::{PolicyId, UploadSessionId};
use reqwest::{Method, RequestBuilder, StatusCode, Url, header};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{
    CreateUploadSessionRequest, DeleteFilesRequest, Envelope, HEADER_CORRELATION_ID,
    HEADER_NODE_ID, HEADER_OVERWRITE, HEADER_SITE_ID, HEADER_SITE_URL, SLAVE_API_PREFIX,
    UploadProgress, decode_data,
};
use crate::chunk::{ChunkGroup, ChunkInfo, ChunkProcessor};
use crate::driver::{DriverContext, MediaMeta, PhysicalObject};
use crate::error::StorageError;
use crate::request::UploadRequest;
use crate::upload::UploadSession;

/// Timeout for control calls. Chunk transfers have none.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for every call.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifetime in hours of sessions created for server-side pushes.
const PUSH_SESSION_TTL_HOURS: i64 = 24;

/// Signed client for one slave node.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base: Url,
    signer: Signer,
    node_id: String,
    policy_id: PolicyId,
    chunk_size: u64,
    ctx: DriverContext,
}

impl RemoteClient {
    /// Create a client for the node at `server`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `server` is not a valid URL.
    pub fn new(
        server: &str,
        node_id: impl Into<String>,
        secret: &str,
        policy_id: PolicyId,
        chunk_size: u64,
        ctx: DriverContext,
    ) -> Result<Self, StorageError> {
        let base = Url::parse(&format!(
            "{}{SLAVE_API_PREFIX}/",
            server.trim_end_matches('/')
        ))
        .map_err(|e| StorageError::configuration(format!("invalid slave server {server}: {e}")))?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StorageError::configuration(e.to_string()))?;

        Ok(Self {
            http,
            base,
            signer: Signer::new(secret),
            node_id: node_id.into(),
            policy_id,
            chunk_size,
            ctx,
        })
    }

    /// Create an upload session on the node.
    ///
    /// # Errors
    ///
    /// Returns the node's error if the session cannot be created.
    pub async fn create_upload_session(
        &self,
        session: &UploadSession,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        let body = CreateUploadSessionRequest {
            session: session.clone(),
            overwrite,
        };
        let request = self
            .signed(Method::PUT, self.endpoint("upload", &[])?)?
            .timeout(CONTROL_TIMEOUT)
            .json(&body);
        Self::send(request).await?;
        debug!(session_id = %session.id, path = %session.path, "Created slave upload session");
        Ok(())
    }

    /// Send one chunk of an upload session.
    ///
    /// # Errors
    ///
    /// Returns the transport or node error; the caller decides whether to retry.
    pub async fn upload_chunk(
        &self,
        session_id: UploadSessionId,
        index: usize,
        body: Bytes,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        let url = self.endpoint(
            &format!("upload/{session_id}"),
            &[("chunk", index.to_string())],
        )?;
        let request = self
            .signed(Method::POST, url)?
            .header(HEADER_OVERWRITE, overwrite.to_string())
            .header(header::CONTENT_LENGTH, body.len())
            .body(body);
        Self::send(request).await?;
        Ok(())
    }

    /// Delete an upload session and whatever it stored.
    ///
    /// # Errors
    ///
    /// Returns the node's error.
    pub async fn delete_upload_session(
        &self,
        session_id: UploadSessionId,
    ) -> Result<(), StorageError> {
        let request = self
            .signed(
                Method::DELETE,
                self.endpoint(&format!("upload/{session_id}"), &[])?,
            )?
            .timeout(CONTROL_TIMEOUT);
        Self::send(request).await?;
        Ok(())
    }

    /// Chunk progress of a live node session.
    ///
    /// # Errors
    ///
    /// A remote `CODE_NOT_FOUND` once the node has finished or dropped the session.
    pub async fn upload_status(
        &self,
        session_id: UploadSessionId,
    ) -> Result<UploadProgress, StorageError> {
        let request = self
            .signed(
                Method::GET,
                self.endpoint(&format!("upload/{session_id}"), &[])?,
            )?
            .timeout(CONTROL_TIMEOUT);
        decode_data(Self::send(request).await?)
    }

    /// Look up a single file on the node by listing its parent directory.
    ///
    /// # Errors
    ///
    /// `NotFound` if the file is absent, or the node's error.
    pub async fn stat(&self, path: &str) -> Result<PhysicalObject, StorageError> {
        let path = path.trim_start_matches('/');
        let parent = path.rsplit_once('/').map_or("", |(parent, _)| parent);
        self.list(parent, false)
            .await?
            .into_iter()
            .find(|object| !object.is_dir && object.source == path)
            .ok_or_else(|| StorageError::not_found(path))
    }

    /// Push a whole file to the node in chunks.
    ///
    /// On a permanent chunk failure the node session is deleted best-effort.
    ///
    /// # Errors
    ///
    /// Returns the session creation error or the failed chunk's error.
    pub async fn upload(&self, mut file: UploadRequest) -> Result<(), StorageError> {
        let expires_at = file
            .props
            .expire
            .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(PUSH_SESSION_TTL_HOURS));
        let session = UploadSession::new(
            self.policy_id,
            file.props.path.clone(),
            file.props.size,
            self.chunk_size,
            expires_at,
        )
        .with_mime_type(file.props.mime_type.clone())
        .with_overwrite(file.props.overwrite);
        self.create_upload_session(&session, file.props.overwrite)
            .await?;

        let overwrite = file.props.overwrite;
        let result = {
            let mut group = ChunkGroup::new(
                &mut file,
                self.chunk_size,
                Box::new(self.ctx.backoff()),
                self.ctx.chunk.buffer,
                &self.ctx.chunk.temp_dir,
            );
            let mut processor = ChunkSender {
                client: self,
                session_id: session.id,
                overwrite,
            };
            let mut outcome = Ok(());
            while group.next() {
                if let Err(err) = group.process(&mut processor).await {
                    outcome = Err(err);
                    break;
                }
            }
            outcome
        };

        if let Err(err) = result {
            if let Err(cleanup) = self.delete_upload_session(session.id).await {
                warn!(session_id = %session.id, error = %cleanup, "Failed to delete slave upload session");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Delete files on the node.
    ///
    /// # Errors
    ///
    /// `PartialDelete` with the node's failed list, or the node's error.
    pub async fn delete_files(&self, files: &[String]) -> Result<(), StorageError> {
        let body = DeleteFilesRequest {
            files: files.to_vec(),
        };
        let request = self
            .signed(Method::DELETE, self.endpoint("file", &[])?)?
            .timeout(CONTROL_TIMEOUT)
            .json(&body);
        Self::send(request).await?;
        Ok(())
    }

    /// Extract media metadata on the node.
    ///
    /// # Errors
    ///
    /// Returns the node's error.
    pub async fn media_meta(&self, path: &str, ext: &str) -> Result<Vec<MediaMeta>, StorageError> {
        let route = format!(
            "file/meta/{}/{}",
            base64_url::encode(path),
            urlencoding::encode(ext)
        );
        let request = self
            .signed(Method::GET, self.endpoint(&route, &[])?)?
            .timeout(CONTROL_TIMEOUT);
        decode_data(Self::send(request).await?)
    }

    /// List objects on the node.
    ///
    /// # Errors
    ///
    /// Returns the node's error.
    pub async fn list(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<PhysicalObject>, StorageError> {
        let url = self.endpoint(
            "file/list",
            &[
                ("recursive", recursive.to_string()),
                ("path", path.to_string()),
            ],
        )?;
        let request = self.signed(Method::GET, url)?.timeout(CONTROL_TIMEOUT);
        decode_data(Self::send(request).await?)
    }

    fn endpoint(&self, route: &str, query: &[(&str, String)]) -> Result<Url, StorageError> {
        let mut url = self
            .base
            .join(route)
            .map_err(|e| StorageError::operation(format!("invalid slave route {route}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    /// Build a request carrying identity headers and a request signature.
    fn signed(&self, method: Method, url: Url) -> Result<RequestBuilder, StorageError> {
        let correlation_id = Uuid::new_v4().to_string();
        let identity = [
            (HEADER_SITE_ID, self.ctx.site_id.as_str()),
            (HEADER_SITE_URL, self.ctx.site_url.as_str()),
            (HEADER_NODE_ID, self.node_id.as_str()),
            (HEADER_CORRELATION_ID, correlation_id.as_str()),
        ];

        let target = signing_target(url.path(), url.query().unwrap_or_default());
        let ttl = chrono::Duration::from_std(self.ctx.request_ttl)
            .unwrap_or(chrono::Duration::seconds(60));
        let token =
            self.signer
                .sign_request(method.as_str(), &target, &identity, Some(Utc::now() + ttl))?;

        let mut builder = self.http.request(method, url).bearer_auth(token);
        for (name, value) in identity {
            builder = builder.header(name, value);
        }
        Ok(builder)
    }

    async fn send(request: RequestBuilder) -> Result<serde_json::Value, StorageError> {
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map_or(Duration::ZERO, Duration::from_secs);
            return Err(StorageError::Throttled {
                retry_after,
                message: format!("slave responded {status}"),
            });
        }

        let body = response.bytes().await?;
        let envelope: Envelope = serde_json::from_slice(&body).map_err(|e| {
            StorageError::Http(format!("slave responded {status} with invalid body: {e}"))
        })?;
        envelope.into_result()
    }
}

/// Sends each chunk to the node.
struct ChunkSender<'c> {
    client: &'c RemoteClient,
    session_id: UploadSessionId,
    overwrite: bool,
}

#[async_trait]
impl ChunkProcessor for ChunkSender<'_> {
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
        self.client
            .upload_chunk(self.session_id, chunk.index, Bytes::from(buf), self.overwrite)
            .await
    }
}
