//! JSON-RPC 2.0 server exposing the build-orchestration coordinator to
//! coding agents and the CLI.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;

use axum::http::{HeaderName, Method, header};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// CORS preflight per the JSON-RPC surface's contract: configurable
/// `Access-Control-Allow-Origin`, `POST, OPTIONS`, and the headers an
/// MCP-style client sends alongside `Content-Type`.
pub fn cors_layer(allowed_origin: &str) -> CorsLayer {
    let origin = if allowed_origin == "*" {
        AllowOrigin::any()
    } else {
        AllowOrigin::exact(
            allowed_origin
                .parse()
                .expect("server_cors_origin must be a valid header value"),
        )
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("mcp-protocol-version")])
        .max_age(Duration::from_secs(3600))
}
