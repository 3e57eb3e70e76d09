//! Application configuration management.

use std::path::PathBuf;

use serde::Deserialize;

use crate::types::PolicyId;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    pub server: ServerConfig,
    /// Public identity of this site.
    pub site: SiteConfig,
    /// URL signing configuration.
    pub signing: SigningConfig,
    /// Chunked upload tuning.
    #[serde(default)]
    pub chunk: ChunkConfig,
    /// Slave node identity; required when `server.role` is `slave`.
    #[serde(default)]
    pub node: Option<NodeConfig>,
    /// Storage policies served by this node.
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

/// Role this process plays in a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Serves the application-facing API.
    #[default]
    Master,
    /// Serves the internal slave protocol for a master.
    Slave,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Master or slave.
    #[serde(default)]
    pub role: NodeRole,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5212
}

/// Site identity, sent to slave nodes with every request.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Stable site identifier.
    pub id: String,
    /// Public base URL, e.g. `https://cloud.example.com`.
    pub url: String,
}

/// URL signing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    /// Secret key for signing URLs.
    pub secret: String,
    /// Default signed URL lifetime in seconds.
    #[serde(default = "default_url_ttl")]
    pub url_ttl_secs: u64,
}

fn default_url_ttl() -> u64 {
    3600 // 1 hour
}

/// Chunked upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkConfig {
    /// Default chunk size in bytes when a policy does not set one.
    #[serde(default = "default_chunk_size")]
    pub size: u64,
    /// Maximum retries per chunk.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Sleep between retries in milliseconds.
    #[serde(default = "default_retry_sleep_ms")]
    pub retry_sleep_ms: u64,
    /// Stage non-seekable chunks in a temp file so they can be retried.
    #[serde(default = "default_buffer")]
    pub buffer: bool,
    /// Directory for chunk temp files.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            max_retries: default_max_retries(),
            retry_sleep_ms: default_retry_sleep_ms(),
            buffer: default_buffer(),
            temp_dir: default_temp_dir(),
        }
    }
}

fn default_chunk_size() -> u64 {
    25 * 1024 * 1024
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_sleep_ms() -> u64 {
    5000
}

fn default_buffer() -> bool {
    true
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Identity of a slave node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Node identifier as known to the master.
    pub id: String,
    /// Secret shared with the master.
    pub secret: String,
}

/// One configured storage policy.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Policy identifier referenced by entities.
    pub id: PolicyId,
    /// Display name.
    pub name: String,
    /// Physical backend.
    pub provider: StorageProvider,
    /// Serve and sign through this application even when the backend could sign.
    #[serde(default)]
    pub internal_proxy: bool,
    /// Reverse-proxy prefix that replaces scheme, host, and path prefix of URLs.
    #[serde(default)]
    pub proxy_server: Option<String>,
    /// Chunk size override in bytes (0 uses `chunk.size`).
    #[serde(default)]
    pub chunk_size: u64,
}

/// Storage provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageProvider {
    /// Local filesystem under `root`.
    Local {
        /// Root directory path.
        root: PathBuf,
    },
    /// S3-compatible storage: Cloudflare R2, Supabase, AWS S3, DigitalOcean Spaces
    S3 {
        /// S3 endpoint URL.
        endpoint: String,
        /// S3 bucket name.
        bucket: String,
        /// AWS access key ID.
        access_key_id: String,
        /// AWS secret access key.
        secret_access_key: String,
        /// AWS region.
        region: String,
    },
    /// Azure Blob Storage
    AzureBlob {
        /// Azure storage account name.
        account: String,
        /// Azure storage access key.
        access_key: String,
        /// Azure container name.
        container: String,
    },
    /// In-process object store, used for tests.
    Memory,
    /// A slave node speaking the internal push protocol.
    Remote {
        /// Base URL of the slave node.
        server: String,
        /// Node identifier sent to the slave.
        node_id: String,
        /// Secret shared with the slave.
        secret: String,
    },
}

impl StorageProvider {
    /// Create local filesystem provider.
    #[must_use]
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::Local { root: root.into() }
    }

    /// Create S3-compatible provider (Cloudflare R2, Supabase, AWS S3).
    #[must_use]
    pub fn s3(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self::S3 {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            region: region.into(),
        }
    }

    /// Create Azure Blob Storage provider.
    #[must_use]
    pub fn azure_blob(
        account: impl Into<String>,
        access_key: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self::AzureBlob {
            account: account.into(),
            access_key: access_key.into(),
            container: container.into(),
        }
    }

    /// Create a slave node provider.
    #[must_use]
    pub fn remote(
        server: impl Into<String>,
        node_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self::Remote {
            server: server.into(),
            node_id: node_id.into(),
            secret: secret.into(),
        }
    }

    /// Get the provider name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::S3 { .. } => "s3",
            Self::AzureBlob { .. } => "azure_blob",
            Self::Memory => "memory",
            Self::Remote { .. } => "remote",
        }
    }
}

impl PolicyConfig {
    /// Create a policy with default proxy and chunk settings.
    #[must_use]
    pub fn new(id: PolicyId, name: impl Into<String>, provider: StorageProvider) -> Self {
        Self {
            id,
            name: name.into(),
            provider,
            internal_proxy: false,
            proxy_server: None,
            chunk_size: 0,
        }
    }

    /// Force serving through the internal proxy.
    #[must_use]
    pub fn with_internal_proxy(mut self, enabled: bool) -> Self {
        self.internal_proxy = enabled;
        self
    }

    /// Rewrite generated URLs through a reverse proxy.
    #[must_use]
    pub fn with_proxy_server(mut self, server: impl Into<String>) -> Self {
        self.proxy_server = Some(server.into());
        self
    }

    /// Override the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size;
        self
    }
}

impl AppConfig {
    /// Loads configuration from environment and config files.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(config::Environment::with_prefix("NIMBUS").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
