//! Signature checks for signed URLs and node-to-node requests.

use axum::{
    Json,
    extract::{OriginalUri, Request, State},
    http::{HeaderMap, StatusCode, Uri, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use nimbus_core::remote::protocol::{CODE_CREDENTIAL_INVALID, Envelope, SIGNED_HEADERS};
use nimbus_shared::signing::{signing_target, split_signature};
use nimbus_shared::{SignatureError, Signer};
use serde_json::json;
use tracing::debug;

/// Extracts the bearer token from the Authorization header.
fn extract_bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
}

/// Full request URI, before any router nesting stripped its prefix.
fn full_uri(request: &Request) -> Uri {
    request
        .extensions()
        .get::<OriginalUri>()
        .map_or_else(|| request.uri().clone(), |original| original.0.clone())
}

/// Split a URI into its signing target and the `sign` parameter.
fn target_and_signature(uri: &Uri) -> (String, Option<String>) {
    let (query, sign) = split_signature(uri.query().unwrap_or_default());
    (signing_target(uri.path(), &query), sign)
}

/// Rejects requests whose URL does not carry a valid `sign` parameter.
pub async fn verify_url_signature(
    State(signer): State<Signer>,
    request: Request,
    next: Next,
) -> Response {
    let (target, sign) = target_and_signature(&full_uri(&request));
    let result = sign
        .ok_or(SignatureError::Missing)
        .and_then(|sign| signer.verify(&target, &sign));

    match result {
        Ok(()) => next.run(request).await,
        Err(e) => {
            debug!(target = %target, error = %e, "Rejected signed URL");
            (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "invalid_signature",
                    "message": e.to_string()
                })),
            )
                .into_response()
        }
    }
}

/// Rejects slave protocol calls that are neither signed URLs nor signed requests.
///
/// Clients holding a URL issued by the master present it with a `sign`
/// parameter; the master itself signs the method, target, and identity headers
/// and sends the token as a bearer credential.
pub async fn verify_node_request(
    State(signer): State<Signer>,
    request: Request,
    next: Next,
) -> Response {
    let (target, sign) = target_and_signature(&full_uri(&request));
    let result = match sign {
        Some(sign) => signer.verify(&target, &sign),
        None => verify_bearer(&signer, request.method().as_str(), &target, request.headers()),
    };

    match result {
        Ok(()) => next.run(request).await,
        Err(e) => {
            debug!(target = %target, error = %e, "Rejected node request");
            (
                StatusCode::FORBIDDEN,
                Json(Envelope::error(CODE_CREDENTIAL_INVALID, e.to_string())),
            )
                .into_response()
        }
    }
}

fn verify_bearer(
    signer: &Signer,
    method: &str,
    target: &str,
    headers: &HeaderMap,
) -> Result<(), SignatureError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or(SignatureError::Missing)?;
    let identity: Vec<(&str, &str)> = SIGNED_HEADERS
        .iter()
        .map(|name| {
            let value = headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            (*name, value)
        })
        .collect();
    signer.verify_request(method, target, &identity, token)
}
