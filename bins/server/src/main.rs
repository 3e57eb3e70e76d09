//! Nimbus Server
//!
//! Runs either the master API or a storage node, depending on `server.role`.

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nimbus_api::{AppState, SlaveState, create_router, create_slave_router};
use nimbus_shared::{AppConfig, NodeRole};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing; NIMBUS_LOG_FORMAT=json switches to JSON lines
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "nimbus=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("NIMBUS_LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // Load configuration
    let config = AppConfig::load()?;

    // Create router for the configured role
    let app = match config.server.role {
        NodeRole::Master => {
            let state = AppState::from_config(&config)?;
            info!(
                site_id = %config.site.id,
                policies = config.policies.len(),
                "Master node configured"
            );
            create_router(state)
        }
        NodeRole::Slave => {
            let state = SlaveState::from_config(&config)?;
            info!(policy = %state.storage.policy.name, "Storage node configured");
            create_slave_router(state)
        }
    };

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(role = ?config.server.role, "Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
