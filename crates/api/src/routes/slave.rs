//! Slave protocol routes, served by storage nodes to their master.
//!
//! Every response except content is a `{code, data, error}` envelope.

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::TryStreamExt;
use nimbus_core::StorageError;
use nimbus_core::entity::Entity;
use nimbus_core::upload::UploadSession;
use nimbus_core::remote::protocol::{
    ChunkQuery, CreateUploadSessionRequest, DeleteFilesRequest, Envelope, ListQuery,
    UploadProgress,
};
use nimbus_core::{UploadProps, UploadRequest};
use nimbus_shared::types::{EntityId, UploadSessionId};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::SlaveState;
use crate::entity::{EntitySource, EntitySourceOptions};
use crate::middleware::signature::verify_node_request;

/// Creates the slave routes behind node signature checks.
pub fn routes_with_state(state: &SlaveState) -> Router<SlaveState> {
    Router::new()
        .route("/upload", put(create_session))
        .route(
            "/upload/{session_id}",
            get(upload_status)
                .post(upload_chunk)
                .delete(delete_session),
        )
        .route("/file", axum::routing::delete(delete_files))
        .route("/file/meta/{path}/{ext}", get(media_meta))
        .route("/file/list", get(list_files))
        .route("/file/content/{path}/{speed}/{name}", get(serve_content))
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn_with_state(
            state.signer.clone(),
            verify_node_request,
        ))
}

// ============================================================================
// Chunk Tracking
// ============================================================================

/// Chunks stored so far for each live upload session on this node.
///
/// Cheap to clone; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct UploadTracker {
    sessions: Arc<DashMap<UploadSessionId, ReceivedChunks>>,
}

#[derive(Debug)]
struct ReceivedChunks {
    received: BTreeSet<usize>,
    total: usize,
    expires_at: DateTime<Utc>,
    finishing: bool,
}

impl UploadTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `session`, dropping entries of expired sessions.
    pub fn start(&self, session: &UploadSession) {
        let now = Utc::now();
        self.sessions.retain(|_, chunks| chunks.expires_at > now);
        self.sessions.insert(
            session.id,
            ReceivedChunks {
                received: BTreeSet::new(),
                total: session.chunk_count(),
                expires_at: session.expires_at,
                finishing: false,
            },
        );
    }

    /// Records a stored chunk. Returns true for exactly one caller once every chunk is in.
    fn record(&self, session: &UploadSession, index: usize) -> bool {
        let mut chunks = self.sessions.entry(session.id).or_insert_with(|| ReceivedChunks {
            received: BTreeSet::new(),
            total: session.chunk_count(),
            expires_at: session.expires_at,
            finishing: false,
        });
        chunks.received.insert(index);
        if chunks.finishing || chunks.received.len() < chunks.total {
            return false;
        }
        chunks.finishing = true;
        true
    }

    /// Forgets `index` after a failed completion so a resend finishes again.
    fn reopen(&self, id: &UploadSessionId, index: usize) {
        if let Some(mut chunks) = self.sessions.get_mut(id) {
            chunks.received.remove(&index);
            chunks.finishing = false;
        }
    }

    fn progress(&self, session: &UploadSession) -> UploadProgress {
        self.sessions.get(&session.id).map_or(
            UploadProgress {
                received: 0,
                total: session.chunk_count(),
            },
            |chunks| UploadProgress {
                received: chunks.received.len(),
                total: chunks.total,
            },
        )
    }

    fn finish(&self, id: &UploadSessionId) {
        self.sessions.remove(id);
    }

    /// True when no session is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn reply(result: Result<Envelope, StorageError>) -> Json<Envelope> {
    Json(result.unwrap_or_else(|e| {
        debug!(error = %e, "Slave request failed");
        Envelope::from_storage_error(&e)
    }))
}

fn decode_path(encoded: &str) -> Result<String, StorageError> {
    let bytes = base64_url::decode(encoded)
        .map_err(|e| StorageError::InvalidKey(format!("invalid path encoding: {e}")))?;
    String::from_utf8(bytes).map_err(|e| StorageError::InvalidKey(e.to_string()))
}

/// Stable id for a node-local file, so its entity tag survives across requests.
fn file_entity_id(path: &str) -> EntityId {
    let digest = Sha256::digest(path.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    EntityId::from_uuid(Uuid::from_bytes(bytes))
}

// ============================================================================
// Route Handlers
// ============================================================================

/// `PUT upload`: create the placeholder and remember the session.
async fn create_session(
    State(state): State<SlaveState>,
    Json(payload): Json<CreateUploadSessionRequest>,
) -> Json<Envelope> {
    let mut session = payload.session;
    let props = UploadProps::new(session.path.clone(), session.size)
        .with_overwrite(payload.overwrite)
        .with_expire(session.expires_at);

    // The master decides the chunk layout.
    let chunk_size = session.chunk_size;
    let result = state.storage.driver.token(&mut session, &props).await;
    session.chunk_size = chunk_size;

    reply(result.map(|_| {
        info!(session_id = %session.id, path = %session.path, size = session.size, "Slave upload session created");
        state.uploads.start(&session);
        state.sessions.insert(session);
        Envelope::ok()
    }))
}

/// `GET upload/{session_id}`: chunk progress of a live session.
async fn upload_status(
    State(state): State<SlaveState>,
    Path(session_id): Path<UploadSessionId>,
) -> Json<Envelope> {
    let Some(session) = state.sessions.get(&session_id) else {
        state.uploads.finish(&session_id);
        return reply(Err(StorageError::SessionNotFound(session_id.to_string())));
    };
    reply(Envelope::with_serialized(&state.uploads.progress(&session)))
}

/// `POST upload/{session_id}?chunk=`: write one chunk at its offset.
///
/// Chunks may arrive in any order; the session finishes once all of them are stored.
async fn upload_chunk(
    State(state): State<SlaveState>,
    Path(session_id): Path<UploadSessionId>,
    Query(query): Query<ChunkQuery>,
    body: Body,
) -> Json<Envelope> {
    let Some(session) = state.sessions.get(&session_id) else {
        return reply(Err(StorageError::SessionNotFound(session_id.to_string())));
    };
    let (offset, length) = match session.chunk_span(query.chunk) {
        Ok(span) => span,
        Err(e) => return reply(Err(e)),
    };

    let mut props = UploadProps::new(session.path.clone(), length)
        .with_offset(offset)
        .with_overwrite(true)
        .with_expire(session.expires_at);
    props.mime_type.clone_from(&session.mime_type);
    let stream = body.into_data_stream().map_err(io::Error::other);
    let request = UploadRequest::from_stream(props, stream);

    let driver = &state.storage.driver;
    if let Err(e) = driver.put(request).await {
        warn!(session_id = %session_id, chunk = query.chunk, error = %e, "Failed to store chunk");
        return reply(Err(e));
    }
    if !state.uploads.record(&session, query.chunk) {
        return reply(Ok(Envelope::ok()));
    }
    if let Err(e) = driver.complete_upload(&session).await {
        state.uploads.reopen(&session_id, query.chunk);
        return reply(Err(e));
    }
    state.sessions.remove(&session_id);
    state.uploads.finish(&session_id);
    info!(session_id = %session_id, size = session.size, "Slave upload finished");
    reply(Ok(Envelope::ok()))
}

/// `DELETE upload/{session_id}`: drop the session and its placeholder.
async fn delete_session(
    State(state): State<SlaveState>,
    Path(session_id): Path<UploadSessionId>,
) -> Json<Envelope> {
    state.uploads.finish(&session_id);
    let Some(session) = state.sessions.remove(&session_id) else {
        return reply(Err(StorageError::SessionNotFound(session_id.to_string())));
    };
    let result = state.storage.driver.cancel_token(&session).await;
    info!(session_id = %session_id, "Slave upload session deleted");
    reply(result.map(|()| Envelope::ok()))
}

/// `DELETE file`: delete files; partial failures answer code 203.
async fn delete_files(
    State(state): State<SlaveState>,
    Json(payload): Json<DeleteFilesRequest>,
) -> Json<Envelope> {
    let result = state.storage.driver.delete(&payload.files).await;
    reply(result.map(|()| Envelope::ok()))
}

/// `GET file/meta/{path}/{ext}`: media metadata.
async fn media_meta(
    State(state): State<SlaveState>,
    Path((path, ext)): Path<(String, String)>,
) -> Json<Envelope> {
    let result = match decode_path(&path) {
        Ok(path) => state.storage.driver.media_meta(&path, &ext).await,
        Err(e) => Err(e),
    };
    reply(result.and_then(|meta| Envelope::with_serialized(&meta)))
}

/// `GET file/list?path=&recursive=`: physical objects under a directory.
async fn list_files(
    State(state): State<SlaveState>,
    Query(query): Query<ListQuery>,
) -> Json<Envelope> {
    let result = state
        .storage
        .driver
        .list(&query.path, query.recursive)
        .await;
    reply(result.and_then(|objects| Envelope::with_serialized(&objects)))
}

/// Query flags of a slave content URL.
#[derive(Debug, Default, Deserialize)]
pub struct SlaveContentQuery {
    /// Serve as an attachment.
    #[serde(default)]
    pub download: bool,
}

/// `GET file/content/{path}/{speed}/{name}`: serve a node-local file.
async fn serve_content(
    State(state): State<SlaveState>,
    Path((path, speed, name)): Path<(String, u64, String)>,
    Query(query): Query<SlaveContentQuery>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Ok(path) = decode_path(&path) else {
        return (StatusCode::BAD_REQUEST, "invalid path").into_response();
    };
    let driver = &state.storage.driver;
    let modified = match driver.local_path(&path) {
        Ok(local) => match tokio::fs::metadata(&local).await {
            Ok(meta) => meta.modified().ok().map(DateTime::<Utc>::from),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return (StatusCode::NOT_FOUND, "file not found").into_response();
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to stat file");
                return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read file").into_response();
            }
        },
        Err(_) => return (StatusCode::NOT_FOUND, "file not found").into_response(),
    };

    let mut entity = Entity::new(state.storage.policy.id, path.clone(), 0);
    entity.id = file_entity_id(&path);
    entity.updated_at = modified.unwrap_or_else(Utc::now);

    let mut source = EntitySource::new(entity, state.storage.clone(), state.serve.clone());
    let applied = source.apply(
        EntitySourceOptions::new()
            .with_speed_limit(speed)
            .with_display_name(name)
            .with_download(query.download),
    );
    if let Err(e) = applied {
        warn!(error = %e, "Failed to apply entity source options");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to serve entity").into_response();
    }
    source.serve(&method, &headers).await
}
