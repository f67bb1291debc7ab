//! Blob store backends.

pub mod local;
pub mod object;
pub mod sftp;

pub use local::LocalStore;
pub use object::{ObjectClient, ObjectStore};
pub use sftp::{SftpClient, SftpConnector, SftpStore};
