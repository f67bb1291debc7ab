//! # Local blob store
//!
//! Filesystem implementation of `BlobStore`.
//! Content-addressed, sharded by the first two hex characters of the SHA-1.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use domains::{blob_keys, BlobStore, FileType, StoreError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o660;

pub struct LocalStore {
    /// Root directory for all uploads (e.g., "./data/images")
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `data` unless the file already exists.
    async fn write_new(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(DIR_MODE);
            builder.create(parent).await?;
        }

        let mut opts = fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(FILE_MODE);

        let mut file = match opts.open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(key, "blob already present");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.root.join(key)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn write(
        &self,
        sha1: &str,
        file_type: FileType,
        thumb_type: FileType,
        src: Bytes,
        thumb: Option<Bytes>,
    ) -> Result<(), StoreError> {
        let (src_key, thumb_key) = blob_keys(sha1, file_type, thumb_type);
        self.write_new(&src_key, &src).await?;
        if let (Some(key), Some(data)) = (thumb_key, thumb) {
            self.write_new(&key, &data).await?;
        }
        Ok(())
    }

    async fn delete(&self, sha1: &str, file_type: FileType, thumb_type: FileType) -> Result<(), StoreError> {
        let (src_key, thumb_key) = blob_keys(sha1, file_type, thumb_type);
        self.remove(&src_key).await?;
        if let Some(key) = thumb_key {
            self.remove(&key).await?;
        }
        Ok(())
    }

    fn serve_root(&self) -> Option<PathBuf> {
        Some(self.root.clone())
    }
}
