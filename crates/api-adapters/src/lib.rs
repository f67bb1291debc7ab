//! # api-adapters
//!
//! The HTTP surface of the upload pipeline. Handlers stay thin: extract,
//! delegate to `services`, map the result onto `{"error": code}` payloads.

pub mod metrics;

#[cfg(feature = "web-axum")]
pub mod http;

pub use metrics::Metrics;

#[cfg(feature = "web-axum")]
pub use http::{build_router, AppState};
