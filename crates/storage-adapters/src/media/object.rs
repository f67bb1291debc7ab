//! # Object storage blob store
//!
//! Stores blobs in an S3-compatible bucket under the same key layout as the
//! filesystem store. Not servable; clients fetch objects from the bucket's
//! own endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use domains::{blob_keys, BlobStore, FileType, StoreError};
use tracing::debug;

/// Minimal object API the store needs.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StoreError>;
    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

pub struct ObjectStore {
    client: Arc<dyn ObjectClient>,
    /// Prepended to every key, without a trailing slash
    prefix: String,
}

impl ObjectStore {
    pub fn new(client: Arc<dyn ObjectClient>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    async fn put_new(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StoreError> {
        let key = self.key(key);
        if self.client.exists(&key).await? {
            debug!(key, "object already present");
            return Ok(());
        }
        self.client.put(&key, data, content_type).await
    }
}

#[async_trait]
impl BlobStore for ObjectStore {
    async fn write(
        &self,
        sha1: &str,
        file_type: FileType,
        thumb_type: FileType,
        src: Bytes,
        thumb: Option<Bytes>,
    ) -> Result<(), StoreError> {
        let (src_key, thumb_key) = blob_keys(sha1, file_type, thumb_type);
        self.put_new(&src_key, src, file_type.mime()).await?;
        if let (Some(key), Some(data)) = (thumb_key, thumb) {
            self.put_new(&key, data, thumb_type.mime()).await?;
        }
        Ok(())
    }

    async fn delete(&self, sha1: &str, file_type: FileType, thumb_type: FileType) -> Result<(), StoreError> {
        let (src_key, thumb_key) = blob_keys(sha1, file_type, thumb_type);
        self.client.delete(&self.key(&src_key)).await?;
        if let Some(key) = thumb_key {
            self.client.delete(&self.key(&key)).await?;
        }
        Ok(())
    }
}

#[cfg(feature = "media-s3")]
pub use s3::{S3Client, S3Options};

#[cfg(feature = "media-s3")]
mod s3 {
    use async_trait::async_trait;
    use aws_sdk_s3::config::{Credentials, Region};
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::Client;
    use bytes::Bytes;
    use domains::StoreError;

    use super::ObjectClient;

    #[derive(Debug, Clone, Default)]
    pub struct S3Options {
        pub endpoint: Option<String>,
        pub region: Option<String>,
        /// Access key id and secret; the default credential chain otherwise
        pub credentials: Option<(String, String)>,
    }

    #[derive(Clone)]
    pub struct S3Client {
        client: Client,
        bucket: String,
    }

    impl S3Client {
        pub fn new(client: Client, bucket: impl Into<String>) -> Self {
            Self {
                client,
                bucket: bucket.into(),
            }
        }

        /// Builds a client from the ambient AWS configuration. `opts`
        /// overrides it, e.g. to point at MinIO or R2.
        pub async fn from_env(bucket: impl Into<String>, opts: S3Options) -> Self {
            let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let mut builder = aws_sdk_s3::config::Builder::from(&shared);
            if let Some(url) = opts.endpoint {
                builder = builder.endpoint_url(url).force_path_style(true);
            }
            if let Some(region) = opts.region {
                builder = builder.region(Region::new(region));
            }
            if let Some((key_id, secret)) = opts.credentials {
                builder = builder.credentials_provider(Credentials::new(key_id, secret, None, None, "cutechan"));
            }
            Self::new(Client::from_conf(builder.build()), bucket)
        }
    }

    fn remote<E: std::fmt::Display>(e: E) -> StoreError {
        StoreError::Remote(e.to_string())
    }

    #[async_trait]
    impl ObjectClient for S3Client {
        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            match self.client.head_object().bucket(&self.bucket).key(key).send().await {
                Ok(_) => Ok(true),
                Err(e) => match e.as_service_error() {
                    Some(se) if se.is_not_found() => Ok(false),
                    _ => Err(remote(aws_sdk_s3::error::DisplayErrorContext(e))),
                },
            }
        }

        async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StoreError> {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type(content_type)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| remote(aws_sdk_s3::error::DisplayErrorContext(e)))?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| remote(aws_sdk_s3::error::DisplayErrorContext(e)))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const SHA: &str = "012a2f912c9ee93ceb0ccb8684a29ec571990a94";

    #[derive(Default)]
    struct Bucket {
        objects: Mutex<HashMap<String, (Bytes, String)>>,
        puts: Mutex<u32>,
    }

    #[async_trait]
    impl ObjectClient for Bucket {
        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            Ok(self.objects.lock().unwrap().contains_key(key))
        }

        async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StoreError> {
            *self.puts.lock().unwrap() += 1;
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (data, content_type.to_string()));
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_with_prefix_and_content_type() {
        let bucket = Arc::new(Bucket::default());
        let store = ObjectStore::new(bucket.clone(), "/images/");
        store
            .write(SHA, FileType::Webm, FileType::Jpeg, Bytes::from_static(b"v"), Some(Bytes::from_static(b"t")))
            .await
            .unwrap();

        let objects = bucket.objects.lock().unwrap();
        let (_, ct) = &objects["images/src/01/2a2f912c9ee93ceb0ccb8684a29ec571990a94.webm"];
        assert_eq!(ct, "video/webm");
        let (_, ct) = &objects["images/thumb/01/2a2f912c9ee93ceb0ccb8684a29ec571990a94.jpg"];
        assert_eq!(ct, "image/jpeg");
        assert!(!store.is_servable());
    }

    #[tokio::test]
    async fn existing_objects_are_not_rewritten() {
        let bucket = Arc::new(Bucket::default());
        let store = ObjectStore::new(bucket.clone(), "");
        for _ in 0..2 {
            store
                .write(SHA, FileType::Mp3, FileType::Jpeg, Bytes::from_static(b"a"), None)
                .await
                .unwrap();
        }
        assert_eq!(*bucket.puts.lock().unwrap(), 1);

        store.delete(SHA, FileType::Mp3, FileType::Jpeg).await.unwrap();
        store.delete(SHA, FileType::Mp3, FileType::Jpeg).await.unwrap();
        assert!(bucket.objects.lock().unwrap().is_empty());
    }
}
