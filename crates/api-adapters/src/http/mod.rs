//! axum router for the upload and posting endpoints.
//!
//! # Endpoints
//!
//! - `POST /api/upload` - multipart `files[]`, optional `idol`; returns `{sha1, token}`
//! - `POST /api/post-token` - returns `{token}` bound to the client address
//! - `POST /api/post` - JSON post request; returns `{id, op}`
//! - `GET /metrics` - OpenMetrics text
//! - `GET /uploads/...` - blobs, when the store is servable

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use services::{BanCache, IngestService, PostingService, TokenManager};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::metrics::Metrics;

pub mod client_ip;
pub mod error;
pub mod handlers;

pub use client_ip::ClientIp;
pub use error::ApiError;

/// Shared by every handler through the `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub tokens: Arc<TokenManager>,
    pub posting: Arc<PostingService>,
    pub bans: Arc<BanCache>,
    pub metrics: Arc<Metrics>,
    /// Take the client address from `X-Forwarded-For`
    pub reverse_proxied: bool,
}

/// `serve_root` mounts a read-only file server at `/uploads`.
/// `body_limit` caps every request body.
pub fn build_router(state: AppState, serve_root: Option<PathBuf>, body_limit: usize) -> Router {
    let mut router = Router::new()
        .route("/api/upload", post(handlers::upload))
        .route("/api/post-token", post(handlers::post_token))
        .route("/api/post", post(handlers::create_post))
        .route("/metrics", get(handlers::metrics));
    if let Some(root) = serve_root {
        router = router.nest_service("/uploads", ServeDir::new(root));
    }
    router
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
