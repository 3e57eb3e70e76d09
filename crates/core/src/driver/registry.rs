//! Builds drivers from policy configuration and looks them up by policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nimbus_shared::types::PolicyId;
use nimbus_shared::{AppConfig, PolicyConfig, Signer, StorageProvider};
use tracing::info;

use super::{Driver, DriverContext, LocalDriver, ObjectDriver, RemoteDriver};
use crate::error::StorageError;

/// Lifetime of signed node-to-node requests.
const REQUEST_SIGNATURE_TTL: Duration = Duration::from_secs(60);

impl DriverContext {
    /// Site-wide driver context from application config.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            site_id: config.site.id.clone(),
            site_url: config.site.url.trim_end_matches('/').to_string(),
            signer: Signer::new(&config.signing.secret),
            chunk: config.chunk.clone(),
            request_ttl: REQUEST_SIGNATURE_TTL,
        }
    }
}

/// Build the driver for a storage policy.
///
/// # Errors
///
/// Returns a configuration error if the provider cannot be initialized.
pub fn build_driver(
    policy: &PolicyConfig,
    ctx: DriverContext,
) -> Result<Arc<dyn Driver>, StorageError> {
    let driver: Arc<dyn Driver> = match &policy.provider {
        StorageProvider::Local { root } => {
            Arc::new(LocalDriver::new(root.clone(), policy.clone(), ctx))
        }
        StorageProvider::S3 { .. } | StorageProvider::AzureBlob { .. } | StorageProvider::Memory => {
            Arc::new(ObjectDriver::from_policy(policy.clone(), ctx)?)
        }
        StorageProvider::Remote {
            server,
            node_id,
            secret,
        } => Arc::new(RemoteDriver::new(server, node_id, secret, policy, ctx)?),
    };
    Ok(driver)
}

/// Policy settings together with its driver.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    /// Policy settings.
    pub policy: PolicyConfig,
    /// Driver serving the policy.
    pub driver: Arc<dyn Driver>,
}

/// Every configured storage policy.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    policies: HashMap<PolicyId, PolicyHandle>,
}

impl DriverRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a driver for every configured policy.
    ///
    /// # Errors
    ///
    /// Returns the first policy that fails to initialize.
    pub fn from_config(config: &AppConfig) -> Result<Self, StorageError> {
        let ctx = DriverContext::from_config(config);
        let mut registry = Self::new();
        for policy in &config.policies {
            let driver = build_driver(policy, ctx.clone())?;
            info!(policy_id = %policy.id, name = %policy.name, provider = policy.provider.name(), "Storage policy ready");
            registry.insert(policy.clone(), driver);
        }
        Ok(registry)
    }

    /// Register a policy with its driver.
    pub fn insert(&mut self, policy: PolicyConfig, driver: Arc<dyn Driver>) {
        self.policies
            .insert(policy.id, PolicyHandle { policy, driver });
    }

    /// Look up a policy.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown policies.
    pub fn get(&self, id: &PolicyId) -> Result<&PolicyHandle, StorageError> {
        self.policies
            .get(id)
            .ok_or_else(|| StorageError::configuration(format!("unknown storage policy {id}")))
    }

    /// First policy using the local disk, if any.
    #[must_use]
    pub fn first_local(&self) -> Option<&PolicyHandle> {
        self.policies
            .values()
            .find(|h| matches!(h.policy.provider, StorageProvider::Local { .. }))
    }

    /// Number of policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether no policy is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
