//! API routes.

pub mod health;
pub mod rpc;

use crate::AppState;
use axum::Router;
use axum::routing::post;

/// Build the main API router: one JSON-RPC endpoint plus liveness probes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rpc", post(rpc::handle))
        .merge(health::router())
        .with_state(state)
}
