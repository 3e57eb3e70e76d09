//! Upload session routes.

use std::io;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, post, put},
};
use futures::TryStreamExt;
use nimbus_core::entity::Entity;
use nimbus_core::upload::{CreateUploadInput, UploadCredential};
use nimbus_shared::types::{PolicyId, UploadSessionId};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::AppState;
use crate::entity::EntitySource;
use crate::error::ApiError;

/// Creates the session routes that need no URL signature.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/file/upload", put(create_session))
        .route("/file/upload/{session_id}", delete(cancel_session))
}

/// Creates the routes reached through signed URLs from an upload credential.
pub fn signed_routes() -> Router<AppState> {
    Router::new()
        .route("/file/upload/{session_id}/complete", post(complete_session))
        .route("/file/upload/{session_id}/{index}", post(upload_chunk))
        .layer(DefaultBodyLimit::disable())
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for creating an upload session.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    /// Target storage policy.
    pub policy_id: PolicyId,
    /// Target path inside the policy.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// MIME type of the file.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Replace an existing object.
    #[serde(default)]
    pub overwrite: bool,
    /// Session lifetime in seconds.
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

/// Response for a relayed chunk.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkResponse {
    /// Session the chunk belongs to.
    pub session_id: UploadSessionId,
    /// Chunk index.
    pub chunk: usize,
}

/// Response for a completed upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteResponse {
    /// Registered entity.
    pub entity: Entity,
    /// Where the entity can be fetched.
    pub url: String,
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Create an upload session and return the client credential.
async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<Json<UploadCredential>, ApiError> {
    let credential = state
        .uploads
        .create_session(CreateUploadInput {
            policy_id: payload.policy_id,
            path: payload.path,
            size: payload.size,
            mime_type: payload.mime_type,
            overwrite: payload.overwrite,
            ttl_secs: payload.ttl_secs,
        })
        .await?;
    Ok(Json(credential))
}

/// Relay one chunk into a local placeholder.
async fn upload_chunk(
    State(state): State<AppState>,
    Path((session_id, index)): Path<(UploadSessionId, usize)>,
    body: Body,
) -> Result<Json<ChunkResponse>, ApiError> {
    let stream = body.into_data_stream().map_err(io::Error::other);
    state
        .uploads
        .upload_chunk(&session_id, index, stream, CancellationToken::new())
        .await?;
    Ok(Json(ChunkResponse {
        session_id,
        chunk: index,
    }))
}

/// Verify the upload and register its entity.
async fn complete_session(
    State(state): State<AppState>,
    Path(session_id): Path<UploadSessionId>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let entity = state.uploads.complete(&session_id).await?;
    let handle = state.registry.get(&entity.policy_id)?.clone();
    let url = EntitySource::new(entity.clone(), handle, state.serve.clone())
        .url()
        .await?;
    info!(session_id = %session_id, entity_id = %entity.id, "Entity registered");
    Ok(Json(CompleteResponse { entity, url }))
}

/// Cancel an upload session.
async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<UploadSessionId>,
) -> Result<impl IntoResponse, ApiError> {
    state.uploads.cancel(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
