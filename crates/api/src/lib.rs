//! HTTP API layer with Axum routes and middleware.
//!
//! This crate provides:
//! - Entity serving (conditional and range requests, reverse proxy)
//! - Upload session routes for the master node
//! - The slave protocol routes for storage nodes
//! - Signature middleware

pub mod entity;
pub mod error;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use nimbus_core::StorageError;
use nimbus_core::driver::{DriverContext, DriverRegistry, PolicyHandle};
use nimbus_core::entity::InMemoryEntityRepository;
use nimbus_core::upload::{SessionStore, UploadService};
use nimbus_shared::{AppConfig, Signer};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::entity::ServeContext;
use crate::routes::slave::UploadTracker;

/// Master node state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Storage policies and their drivers.
    pub registry: Arc<DriverRegistry>,
    /// Stored entities.
    pub entities: Arc<InMemoryEntityRepository>,
    /// Upload orchestration.
    pub uploads: Arc<UploadService<InMemoryEntityRepository>>,
    /// Entity linking and serving settings.
    pub serve: ServeContext,
}

impl AppState {
    /// Assemble master state from its parts.
    #[must_use]
    pub fn new(registry: DriverRegistry, driver_ctx: DriverContext, serve: ServeContext) -> Self {
        let registry = Arc::new(registry);
        let entities = Arc::new(InMemoryEntityRepository::new());
        let uploads = Arc::new(UploadService::new(
            Arc::clone(&registry),
            Arc::clone(&entities),
            driver_ctx,
        ));
        Self {
            registry,
            entities,
            uploads,
            serve,
        }
    }

    /// Build master state from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a storage policy cannot be initialized.
    pub fn from_config(config: &AppConfig) -> Result<Self, StorageError> {
        let registry = DriverRegistry::from_config(config)?;
        let serve = ServeContext::from_config(config, Signer::new(&config.signing.secret))?;
        Ok(Self::new(registry, DriverContext::from_config(config), serve))
    }
}

/// Slave node state shared across handlers.
#[derive(Debug, Clone)]
pub struct SlaveState {
    /// Local storage the node serves.
    pub storage: PolicyHandle,
    /// Upload sessions created by the master.
    pub sessions: SessionStore,
    /// Chunks stored per live session.
    pub uploads: UploadTracker,
    /// Verifies master requests and signed URLs (node secret).
    pub signer: Signer,
    /// Content serving settings.
    pub serve: ServeContext,
}

impl SlaveState {
    /// Build slave state from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error without a `node` section or a local policy.
    pub fn from_config(config: &AppConfig) -> Result<Self, StorageError> {
        let node = config
            .node
            .as_ref()
            .ok_or_else(|| StorageError::configuration("slave role requires a [node] section"))?;
        let registry = DriverRegistry::from_config(config)?;
        let storage = registry.first_local().cloned().ok_or_else(|| {
            StorageError::configuration("slave role requires a local storage policy")
        })?;
        let signer = Signer::new(&node.secret);
        let serve = ServeContext::from_config(config, signer.clone())?;
        Ok(Self {
            storage,
            sessions: SessionStore::new(),
            uploads: UploadTracker::new(),
            signer,
            serve,
        })
    }
}

/// Creates the master application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes_with_state(&state))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Creates the slave node router.
pub fn create_slave_router(state: SlaveState) -> Router {
    let api = Router::new()
        .merge(routes::health::routes())
        .nest("/slave", routes::slave::routes_with_state(&state));
    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
