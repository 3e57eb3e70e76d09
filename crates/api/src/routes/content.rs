//! Internal proxy content endpoint.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use nimbus_core::entity::EntityRepository;
use nimbus_shared::types::EntityId;
use serde::Deserialize;
use tracing::{debug, error};

use crate::AppState;
use crate::entity::{EntitySource, EntitySourceOptions};

/// Creates the content routes. Callers must put them behind URL signature checks.
pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/file/content/{entity_id}/{speed}/{name}",
        get(serve_entity),
    )
}

/// Query flags of a content URL.
#[derive(Debug, Default, Deserialize)]
pub struct ContentQuery {
    /// Serve as an attachment.
    #[serde(default)]
    pub download: bool,
    /// Serve the thumbnail.
    #[serde(default)]
    pub thumb: bool,
}

/// Serve an entity (GET and HEAD).
async fn serve_entity(
    State(state): State<AppState>,
    Path((entity_id, speed, name)): Path<(String, u64, String)>,
    Query(query): Query<ContentQuery>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Ok(id) = entity_id.parse::<EntityId>() else {
        return (StatusCode::NOT_FOUND, "entity not found").into_response();
    };

    let mut source = if id.is_nil() {
        EntitySource::placeholder(state.serve.clone())
    } else {
        let entity = match state.entities.find_by_id(id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                debug!(entity_id = %id, "Entity not found");
                return (StatusCode::NOT_FOUND, "entity not found").into_response();
            }
            Err(e) => {
                error!(entity_id = %id, error = %e, "Failed to load entity");
                return (StatusCode::INTERNAL_SERVER_ERROR, "failed to load entity")
                    .into_response();
            }
        };
        let handle = match state.registry.get(&entity.policy_id) {
            Ok(handle) => handle.clone(),
            Err(e) => {
                error!(entity_id = %id, error = %e, "Entity policy is not configured");
                return (StatusCode::INTERNAL_SERVER_ERROR, "storage policy unavailable")
                    .into_response();
            }
        };
        EntitySource::new(entity, handle, state.serve.clone())
    };

    let applied = source.apply(
        EntitySourceOptions::new()
            .with_speed_limit(speed)
            .with_display_name(name)
            .with_download(query.download)
            .with_thumb(query.thumb),
    );
    if let Err(e) = applied {
        error!(error = %e, "Failed to apply entity source options");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to serve entity").into_response();
    }
    source.serve(&method, &headers).await
}
