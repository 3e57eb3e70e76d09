//! Links and serves one stored entity.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{Duration, Utc};
use nimbus_core::StorageError;
use nimbus_core::disposition;
use nimbus_core::driver::{CapabilityFlags, PolicyHandle, SourceArgs};
use nimbus_core::entity::Entity;
use nimbus_shared::{AppConfig, Signer};
use nimbus_shared::types::{EntityId, PolicyId};
use reqwest::Url;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use super::options::EntitySourceOptions;
use super::proxy;
use super::serve::{FileContent, ServeParams, serve_content};

/// Lifetime of the direct URL fetched when reverse-proxying.
const PROXY_SOURCE_TTL_SECS: i64 = 60;

const PROXY_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Site-wide settings for linking and serving entities.
#[derive(Debug, Clone)]
pub struct ServeContext {
    /// Public base URL of this site.
    pub site_url: String,
    /// Signs internal content URLs.
    pub signer: Signer,
    /// Lifetime of internal content URLs without an explicit expiry.
    pub url_ttl: Duration,
    /// Client for reverse-proxying.
    pub http: reqwest::Client,
}

impl ServeContext {
    /// Serving settings from application config.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn from_config(config: &AppConfig, signer: Signer) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(PROXY_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| StorageError::configuration(e.to_string()))?;
        Ok(Self {
            site_url: config.site.url.trim_end_matches('/').to_string(),
            signer,
            url_ttl: Duration::from_std(std::time::Duration::from_secs(
                config.signing.url_ttl_secs,
            ))
            .map_err(|e| StorageError::configuration(format!("invalid url ttl: {e}")))?,
            http,
        })
    }
}

/// One entity bound to its policy for the duration of a request.
#[derive(Debug)]
pub struct EntitySource {
    entity: Entity,
    handle: Option<PolicyHandle>,
    ctx: ServeContext,
    options: EntitySourceOptions,
    // Set by the first `url` or `serve`.
    frozen: AtomicBool,
    reader: Option<FileContent>,
}

impl EntitySource {
    /// Source for a stored entity.
    #[must_use]
    pub fn new(entity: Entity, handle: PolicyHandle, ctx: ServeContext) -> Self {
        Self {
            entity,
            handle: Some(handle),
            ctx,
            options: EntitySourceOptions::default(),
            frozen: AtomicBool::new(false),
            reader: None,
        }
    }

    /// Source for the placeholder entity, which is always empty.
    #[must_use]
    pub fn placeholder(ctx: ServeContext) -> Self {
        Self {
            entity: Entity::placeholder(PolicyId::from_uuid(uuid::Uuid::nil())),
            handle: None,
            ctx,
            options: EntitySourceOptions::default(),
            frozen: AtomicBool::new(false),
            reader: None,
        }
    }

    /// Merge options into the ones already applied.
    ///
    /// # Errors
    ///
    /// Fails once `url` or `serve` has run; options are fixed from then on.
    pub fn apply(&mut self, options: EntitySourceOptions) -> Result<&mut Self, StorageError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(StorageError::operation(
                "entity source options cannot change after serving started",
            ));
        }
        self.options.merge(options);
        Ok(self)
    }

    /// The wrapped entity.
    #[must_use]
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Options currently in effect.
    #[must_use]
    pub fn options(&self) -> &EntitySourceOptions {
        &self.options
    }

    /// Strong entity tag.
    #[must_use]
    pub fn etag(&self) -> String {
        entity_etag(&self.entity.id)
    }

    /// Whether URLs point at this application instead of the backend.
    #[must_use]
    pub fn uses_internal_proxy(&self) -> bool {
        let Some(handle) = &self.handle else {
            return true;
        };
        self.entity.is_placeholder()
            || handle
                .driver
                .capabilities()
                .has(CapabilityFlags::PROXY_REQUIRED)
            || (handle.policy.internal_proxy && !self.options.no_internal_proxy.unwrap_or(false))
    }

    /// URL a client can fetch the entity from.
    ///
    /// # Errors
    ///
    /// Signing errors, the driver's URL error, or an invalid proxy server.
    pub async fn url(&self) -> Result<String, StorageError> {
        self.frozen.store(true, Ordering::Release);
        let name = self.display_name();

        if self.uses_internal_proxy() {
            let mut route = format!(
                "/api/v1/file/content/{}/{}/{}",
                self.entity.id,
                self.options.speed(),
                urlencoding::encode(&name)
            );
            let mut query = Vec::new();
            if self.options.download() {
                query.push("download=true");
            }
            if self.options.thumb() {
                query.push("thumb=true");
            }
            if !query.is_empty() {
                route.push('?');
                route.push_str(&query.join("&"));
            }

            let expire = self
                .options
                .expire
                .unwrap_or_else(|| Utc::now() + self.ctx.url_ttl);
            let signed = self.ctx.signer.sign_uri(&route, Some(expire))?;
            let url = format!("{}{signed}", self.ctx.site_url);
            return match &self.handle {
                Some(handle) if handle.driver.capabilities().has(CapabilityFlags::LOCAL_READ) => {
                    apply_proxy_server(&url, handle.policy.proxy_server.as_deref())
                }
                _ => Ok(url),
            };
        }

        let handle = self.handle()?;
        let expire = handle
            .driver
            .capabilities()
            .clamp_expire(self.options.expire, Utc::now());
        let url = if self.options.thumb() {
            handle
                .driver
                .thumb(&self.entity.source, extension(&name), expire)
                .await?
        } else {
            let args = SourceArgs {
                expire,
                is_download: self.options.download(),
                speed: self.options.speed(),
                display_name: name,
            };
            handle.driver.source(&self.entity.source, &args).await?
        };
        apply_proxy_server(&url, handle.policy.proxy_server.as_deref())
    }

    /// Answer an HTTP request for the entity.
    pub async fn serve(&mut self, method: &Method, headers: &HeaderMap) -> Response {
        self.frozen.store(true, Ordering::Release);
        if self.entity.is_placeholder() {
            let params = self.serve_params(0);
            return serve_content(method, headers, params, &mut Bytes::new()).await;
        }
        let Some(handle) = self.handle.clone() else {
            return (StatusCode::INTERNAL_SERVER_ERROR, "entity has no policy").into_response();
        };

        let local = handle
            .driver
            .capabilities()
            .has(CapabilityFlags::LOCAL_READ);
        if local && !self.options.thumb() {
            self.serve_local(&handle, method, headers).await
        } else {
            self.serve_proxy(&handle, method, headers).await
        }
    }

    async fn serve_local(
        &mut self,
        handle: &PolicyHandle,
        method: &Method,
        headers: &HeaderMap,
    ) -> Response {
        let mut reader = match self.reader.take() {
            Some(reader) => reader,
            None => match open_local(handle, &self.entity.source).await {
                Ok(reader) => reader,
                Err(err) if err.is_not_found() => {
                    debug!(entity_id = %self.entity.id, "Entity file is missing");
                    return (StatusCode::NOT_FOUND, "file not found").into_response();
                }
                Err(err) => {
                    error!(entity_id = %self.entity.id, error = %err, "Failed to open entity");
                    return (StatusCode::INTERNAL_SERVER_ERROR, "failed to open file")
                        .into_response();
                }
            },
        };

        let size = match reader.size().await {
            Ok(size) => size,
            Err(err) => {
                error!(entity_id = %self.entity.id, error = %err, "Failed to stat entity");
                return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read file").into_response();
            }
        };
        let params = self.serve_params(size);
        let response = serve_content(method, headers, params, &mut reader).await;
        self.reader = Some(reader);
        response
    }

    async fn serve_proxy(
        &self,
        handle: &PolicyHandle,
        method: &Method,
        headers: &HeaderMap,
    ) -> Response {
        let name = self.display_name();
        let now = Utc::now();
        let expire = handle
            .driver
            .capabilities()
            .clamp_expire(Some(now + Duration::seconds(PROXY_SOURCE_TTL_SECS)), now);

        let url = if self.options.thumb() {
            handle
                .driver
                .thumb(&self.entity.source, extension(&name), expire)
                .await
        } else {
            let args = SourceArgs {
                expire,
                is_download: false,
                speed: self.options.speed(),
                display_name: name,
            };
            handle.driver.source(&self.entity.source, &args).await
        };

        match url {
            Ok(url) => {
                let disposition = self.disposition();
                proxy::forward(&self.ctx.http, method, &url, headers, Some(&disposition)).await
            }
            Err(StorageError::Unsupported(what)) => {
                debug!(entity_id = %self.entity.id, what, "Backend cannot produce this content");
                (StatusCode::NOT_FOUND, "content not available").into_response()
            }
            Err(err) => {
                error!(entity_id = %self.entity.id, error = %err, "Failed to sign source URL");
                (StatusCode::INTERNAL_SERVER_ERROR, "failed to resolve source").into_response()
            }
        }
    }

    fn serve_params(&self, size: u64) -> ServeParams {
        ServeParams {
            name: self.display_name(),
            size,
            modified: (!self.entity.is_placeholder()).then_some(self.entity.updated_at),
            etag: Some(self.etag()),
            content_type: None,
            disposition: Some(self.disposition()),
            speed: self.options.speed(),
        }
    }

    fn disposition(&self) -> String {
        let name = self.display_name();
        if self.options.download() {
            disposition::attachment(&name)
        } else {
            disposition::inline(&name)
        }
    }

    fn display_name(&self) -> String {
        match &self.options.display_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self
                .entity
                .source
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    fn handle(&self) -> Result<&PolicyHandle, StorageError> {
        self.handle
            .as_ref()
            .ok_or_else(|| StorageError::configuration("placeholder entity has no policy"))
    }
}

async fn open_local(handle: &PolicyHandle, source: &str) -> Result<FileContent, StorageError> {
    let file = handle.driver.open(source).await?;
    let path = handle.driver.local_path(source)?;
    Ok(FileContent::new(file, path))
}

/// Quoted SHA-256 prefix of the entity id.
#[must_use]
pub fn entity_etag(id: &EntityId) -> String {
    let digest = Sha256::digest(id.to_string().as_bytes());
    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!("\"{hex}\"")
}

fn extension(name: &str) -> &str {
    name.rsplit_once('.').map_or("", |(_, ext)| ext)
}

/// Rewrite scheme, host and path prefix of `url` to those of `proxy`.
fn apply_proxy_server(url: &str, proxy: Option<&str>) -> Result<String, StorageError> {
    let Some(proxy) = proxy.filter(|p| !p.is_empty()) else {
        return Ok(url.to_string());
    };
    let mut target =
        Url::parse(url).map_err(|e| StorageError::operation(format!("invalid url {url}: {e}")))?;
    let base = Url::parse(proxy)
        .map_err(|e| StorageError::configuration(format!("invalid proxy server {proxy}: {e}")))?;

    let path = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        target.path().trim_start_matches('/')
    );
    target
        .set_scheme(base.scheme())
        .map_err(|()| StorageError::configuration(format!("unusable proxy scheme {proxy}")))?;
    target
        .set_host(base.host_str())
        .map_err(|e| StorageError::configuration(format!("unusable proxy host {proxy}: {e}")))?;
    target
        .set_port(base.port())
        .map_err(|()| StorageError::configuration(format!("unusable proxy port {proxy}")))?;
    target.set_path(&path);
    Ok(target.into())
}

#[cfg(test)]
mod tests {
    use axum::http::header;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use nimbus_core::driver::{DriverContext, build_driver};
    use nimbus_shared::{ChunkConfig, PolicyConfig, StorageProvider};
    use rstest::rstest;

    use super::*;

    fn ctx() -> ServeContext {
        ServeContext {
            site_url: "https://cloud.example.com".into(),
            signer: Signer::new("site-secret"),
            url_ttl: Duration::hours(1),
            http: reqwest::Client::new(),
        }
    }

    fn driver_ctx() -> DriverContext {
        DriverContext {
            site_id: "site".into(),
            site_url: "https://cloud.example.com".into(),
            signer: Signer::new("site-secret"),
            chunk: ChunkConfig::default(),
            request_ttl: std::time::Duration::from_secs(60),
        }
    }

    fn handle(policy: PolicyConfig) -> PolicyHandle {
        PolicyHandle {
            driver: build_driver(&policy, driver_ctx()).unwrap(),
            policy,
        }
    }

    fn local(root: &std::path::Path) -> PolicyHandle {
        handle(PolicyConfig::new(
            PolicyId::new(),
            "disk",
            StorageProvider::local(root),
        ))
    }

    fn entity(policy: &PolicyHandle, source: &str, size: u64) -> Entity {
        let mut entity = Entity::new(policy.policy.id, source, size);
        entity.updated_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        entity
    }

    #[test]
    fn test_etag_is_stable_and_quoted() {
        let id = EntityId::new();
        let etag = entity_etag(&id);
        assert_eq!(etag, entity_etag(&id));
        assert_eq!(etag.len(), 34);
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert_ne!(etag, entity_etag(&EntityId::new()));
    }

    #[rstest]
    #[case("https://cloud.example.com/api/v1/file/content/x?sign=t", "https://cdn.example.net/edge/", "https://cdn.example.net/edge/api/v1/file/content/x?sign=t")]
    #[case("http://127.0.0.1:5212/a/b", "https://proxy.example.net:8443", "https://proxy.example.net:8443/a/b")]
    fn test_proxy_server_rewrite(#[case] url: &str, #[case] proxy: &str, #[case] expected: &str) {
        assert_eq!(apply_proxy_server(url, Some(proxy)).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_local_url_is_signed_internal_route() {
        let dir = tempfile::tempdir().unwrap();
        let policy = local(dir.path());
        let e = entity(&policy, "docs/report final.pdf", 3);
        let id = e.id;
        let mut source = EntitySource::new(e, policy, ctx());
        source
            .apply(EntitySourceOptions::new().with_download(true).with_speed_limit(1024))
            .unwrap();

        assert!(source.uses_internal_proxy());
        let url = source.url().await.unwrap();
        let path = url.strip_prefix("https://cloud.example.com").unwrap();
        let (target, sign) = nimbus_shared::signing::split_signature(path.split_once('?').unwrap().1);
        let route = format!("/api/v1/file/content/{id}/1024/report%20final.pdf");
        assert_eq!(target, "download=true");
        ctx()
            .signer
            .verify(&format!("{route}?{target}"), &sign.unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn test_local_url_goes_through_proxy_server() {
        let dir = tempfile::tempdir().unwrap();
        let policy = local(dir.path());
        let policy = PolicyHandle {
            policy: policy.policy.with_proxy_server("https://edge.example.net"),
            driver: policy.driver,
        };
        let source = EntitySource::new(entity(&policy, "a.txt", 1), policy, ctx());
        let url = source.url().await.unwrap();
        assert!(url.starts_with("https://edge.example.net/api/v1/file/content/"), "{url}");
    }

    #[tokio::test]
    async fn test_placeholder_url_and_body() {
        let mut source = EntitySource::placeholder(ctx());
        assert!(source.uses_internal_proxy());
        let url = source.url().await.unwrap();
        assert!(url.contains(&format!("/api/v1/file/content/{}/0/", EntityId::nil())));

        let response = source.serve(&Method::GET, &HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "0");
        assert!(response.headers().get(header::LAST_MODIFIED).is_none());
    }

    #[tokio::test]
    async fn test_object_url_is_presigned_direct() {
        let policy = handle(PolicyConfig::new(PolicyId::new(), "mem", StorageProvider::Memory));
        let source = EntitySource::new(entity(&policy, "a.txt", 1), policy, ctx());
        assert!(!source.uses_internal_proxy());
    }

    #[tokio::test]
    async fn test_internal_proxy_policy_can_be_opted_out() {
        let policy = handle(
            PolicyConfig::new(PolicyId::new(), "mem", StorageProvider::Memory)
                .with_internal_proxy(true),
        );
        let mut source = EntitySource::new(entity(&policy, "a.txt", 1), policy, ctx());
        assert!(source.uses_internal_proxy());
        source
            .apply(EntitySourceOptions::new().with_no_internal_proxy(true))
            .unwrap();
        assert!(!source.uses_internal_proxy());
    }

    #[tokio::test]
    async fn test_serve_local_file_with_range() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hello world")
            .await
            .unwrap();
        let policy = local(dir.path());
        let mut source = EntitySource::new(entity(&policy, "a.txt", 11), policy, ctx());
        source
            .apply(EntitySourceOptions::new().with_download(true))
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=6-".parse().unwrap());
        let response = source.serve(&Method::GET, &headers).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 6-10/11");
        assert_eq!(response.headers()[header::ETAG], source.etag().as_str());
        assert!(response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("attachment;"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"world");
    }

    #[tokio::test]
    async fn test_options_are_frozen_after_serving_starts() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hi").await.unwrap();
        let policy = local(dir.path());
        let mut source = EntitySource::new(entity(&policy, "a.txt", 2), policy, ctx());

        let response = source.serve(&Method::GET, &HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::OK);

        assert!(source.apply(EntitySourceOptions::new().with_download(true)).is_err());
        assert_eq!(source.options().is_download, None);
    }

    #[tokio::test]
    async fn test_options_are_frozen_after_url() {
        let mut source = EntitySource::placeholder(ctx());
        source.url().await.unwrap();
        assert!(
            source
                .apply(EntitySourceOptions::new().with_speed_limit(1))
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_missing_local_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let policy = local(dir.path());
        let mut source = EntitySource::new(entity(&policy, "gone.txt", 4), policy, ctx());
        let response = source.serve(&Method::GET, &HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_object_entity_without_presign_is_not_available() {
        let policy = handle(PolicyConfig::new(PolicyId::new(), "mem", StorageProvider::Memory));
        let mut source = EntitySource::new(entity(&policy, "a.txt", 1), policy, ctx());
        let response = source.serve(&Method::GET, &HeaderMap::new()).await;
        // The in-memory service cannot presign reads.
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
