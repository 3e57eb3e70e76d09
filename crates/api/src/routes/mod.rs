//! API route definitions.

use axum::{Router, middleware};

use crate::{AppState, middleware::signature::verify_url_signature};

pub mod content;
pub mod health;
pub mod slave;
pub mod upload;

/// Creates the master API router; signed routes check the `sign` parameter.
pub fn api_routes_with_state(state: &AppState) -> Router<AppState> {
    let signed_routes = Router::new()
        .merge(content::routes())
        .merge(upload::signed_routes())
        .layer(middleware::from_fn_with_state(
            state.serve.signer.clone(),
            verify_url_signature,
        ));

    Router::new()
        .merge(health::routes())
        .merge(upload::routes())
        .merge(signed_routes)
}
