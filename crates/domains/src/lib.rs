//! # domains
//!
//! Models, ports and the error vocabulary of the media ingestion core.
//! Nothing in this crate performs I/O.

pub mod command;
pub mod errors;
pub mod layout;
pub mod models;
pub mod ports;

// Re-exporting for easier access in other crates
pub use command::Command;
pub use errors::*;
pub use layout::{blob_key, blob_keys, BlobKind};
pub use models::*;
pub use ports::*;
