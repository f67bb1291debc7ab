//! # services
//!
//! The media ingestion pipeline and its neighbours, written purely against
//! the ports in `domains`.

pub mod bans;
pub mod ingest;
pub mod posting;
pub mod tokens;
pub mod upkeep;
pub mod workers;

pub use bans::BanCache;
pub use ingest::{Allocated, IngestService};
pub use posting::{PostRequest, PostingService};
pub use tokens::TokenManager;
pub use upkeep::{Schedule, Upkeep};
pub use workers::WorkerPool;
