//! # storage-adapters
//!
//! Driven-side adapters: the SQLite repositories, the three blob store
//! backends and both halves of the thumbnailer process protocol.

#[cfg(feature = "db-sqlite")]
pub mod db;
pub mod media;
pub mod thumbnailer;

#[cfg(feature = "db-sqlite")]
pub use db::SqliteStore;
pub use media::{LocalStore, ObjectStore, SftpStore};
pub use thumbnailer::ProcessThumbnailer;
