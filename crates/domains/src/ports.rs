//! # Ports
//!
//! Every adapter must implement these traits to be wired into the services.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{RepoError, StoreError, ThumbError};
use crate::models::{
    Ban, FileType, ImageAllocToken, ImageCommon, NewPost, Post, PostToken, SessionToken,
    Thumbnail,
};

/// Produces a thumbnail and probe result for one source file.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Thumbnailer: Send + Sync {
    async fn thumbnail(&self, src: Bytes) -> Result<Thumbnail, ThumbError>;
}

/// Content-addressed storage of source + thumbnail pairs.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes both objects. An object that already exists counts as written.
    async fn write(
        &self,
        sha1: &str,
        file_type: FileType,
        thumb_type: FileType,
        src: Bytes,
        thumb: Option<Bytes>,
    ) -> Result<(), StoreError>;

    /// Removes both objects. Missing objects are not an error.
    async fn delete(
        &self,
        sha1: &str,
        file_type: FileType,
        thumb_type: FileType,
    ) -> Result<(), StoreError>;

    /// Local directory the HTTP layer may serve blobs from. Stores served
    /// out-of-band return `None`.
    fn serve_root(&self) -> Option<PathBuf> {
        None
    }

    fn is_servable(&self) -> bool {
        self.serve_root().is_some()
    }
}

/// An open transaction holding a pending change to one image row: a fresh
/// insert during allocation, or a delete during collection.
///
/// Dropping it without calling either method rolls back.
#[async_trait]
pub trait Allocation: Send {
    async fn commit(self: Box<Self>) -> Result<(), RepoError>;
    async fn rollback(self: Box<Self>) -> Result<(), RepoError>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ImageRepo: Send + Sync {
    async fn find_image(&self, sha1: &str) -> Result<Option<ImageCommon>, RepoError>;

    /// Opens a transaction and inserts `image`. A row with the same SHA-1
    /// yields [`RepoError::Conflict`].
    async fn begin_allocation(
        &self,
        image: &ImageCommon,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn Allocation>, RepoError>;

    /// Images referenced by no post, no idol and no live allocation token.
    async fn unreferenced_images(&self, now: DateTime<Utc>) -> Result<Vec<ImageCommon>, RepoError>;

    /// Opens a transaction and deletes the row if it is still unreferenced.
    /// The row stays write-locked until the returned handle commits or rolls
    /// back, so no reference can be added while its blobs are removed.
    /// `None` when the row is gone or referenced again.
    async fn begin_reclaim(
        &self,
        sha1: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Box<dyn Allocation>>, RepoError>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TokenRepo: Send + Sync {
    /// [`RepoError::Conflict`] when the token string is already taken.
    async fn insert_image_token(&self, token: &ImageAllocToken) -> Result<(), RepoError>;

    /// Deletes a live token and returns the image bound to it.
    async fn take_image_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ImageCommon>, RepoError>;

    async fn delete_image_token(&self, token: &str) -> Result<(), RepoError>;

    /// Inserts unless `token.ip` already holds a live token, in which case
    /// `Ok(false)` is returned and nothing is written.
    async fn insert_post_token(
        &self,
        token: &PostToken,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    /// Deletes a live token and returns the IP it was issued to.
    async fn take_post_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, RepoError>;

    async fn insert_session(&self, session: &SessionToken) -> Result<(), RepoError>;

    async fn session_user(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, RepoError>;

    async fn delete_session(&self, token: &str) -> Result<(), RepoError>;

    async fn expire_image_tokens(&self, now: DateTime<Utc>) -> Result<u64, RepoError>;
    async fn expire_post_tokens(&self, now: DateTime<Utc>) -> Result<u64, RepoError>;
    async fn expire_sessions(&self, now: DateTime<Utc>) -> Result<u64, RepoError>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PostRepo: Send + Sync {
    /// Creation time of the newest post (or thread, when `threads_only`)
    /// made from `ip`.
    async fn last_post_at(
        &self,
        ip: &str,
        threads_only: bool,
    ) -> Result<Option<DateTime<Utc>>, RepoError>;

    /// Inserts the post and attaches the images bound to `image_tokens`.
    /// The post token (bound to `post.ip`) and the image tokens are consumed
    /// in the same transaction. A missing or expired token aborts with
    /// [`RepoError::NotFound`] and consumes nothing.
    async fn insert_post(
        &self,
        post: &NewPost,
        post_token: &str,
        image_tokens: &[String],
    ) -> Result<Post, RepoError>;

    async fn get_post(&self, id: i64) -> Result<Option<Post>, RepoError>;

    /// Nulls the IP of posts created before `cutoff`.
    async fn clear_ips_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait BanRepo: Send + Sync {
    async fn insert_ban(&self, ban: &Ban) -> Result<(), RepoError>;
    async fn active_bans(&self, now: DateTime<Utc>) -> Result<Vec<Ban>, RepoError>;
    async fn expire_bans(&self, now: DateTime<Utc>) -> Result<u64, RepoError>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait IdolRepo: Send + Sync {
    async fn insert_idol(&self, id: Uuid) -> Result<(), RepoError>;

    /// `None` if the idol does not exist, `Some(None)` if it has no preview.
    async fn idol_preview(&self, id: Uuid) -> Result<Option<Option<String>>, RepoError>;

    async fn set_idol_preview(&self, id: Uuid, sha1: &str) -> Result<(), RepoError>;
}
