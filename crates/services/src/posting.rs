//! # Post creation
//!
//! The consumer of allocation tokens. A post redeems one post token and any
//! number of image tokens, all inside the transaction that inserts the post,
//! so a rejected post consumes nothing.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use domains::{Command, DomainError, NewPost, Post, PostRepo, RepoError, TokenKind};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::bans::BanCache;
use crate::tokens::check_len;

/// Minimum spacing between two threads from one IP, in seconds.
pub const THREAD_FLOOR_SECS: i64 = 60;
/// Minimum spacing between two posts from one IP, in seconds.
pub const POST_FLOOR_SECS: i64 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostRequest {
    /// Thread to reply to; `None` opens a new thread
    #[serde(default)]
    pub op: Option<i64>,
    pub post_token: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub image_tokens: Vec<String>,
}

pub struct PostingService {
    posts: Arc<dyn PostRepo>,
    bans: Arc<BanCache>,
    max_files: usize,
}

impl PostingService {
    pub fn new(posts: Arc<dyn PostRepo>, bans: Arc<BanCache>, max_files: usize) -> Self {
        Self {
            posts,
            bans,
            max_files,
        }
    }

    /// Cheap checks that need no I/O.
    fn validate(&self, req: &PostRequest) -> Result<(), DomainError> {
        if req.image_tokens.len() > self.max_files {
            return Err(DomainError::TooManyFiles);
        }
        check_len(TokenKind::Post, &req.post_token)?;
        for token in &req.image_tokens {
            check_len(TokenKind::ImageAlloc, token)?;
        }
        if req.body.trim().is_empty() && req.image_tokens.is_empty() {
            return Err(DomainError::NoContent);
        }
        Ok(())
    }

    async fn check_floors(&self, ip: &str, new_thread: bool, now: DateTime<Utc>) -> Result<(), DomainError> {
        if new_thread {
            if let Some(last) = self.posts.last_post_at(ip, true).await? {
                if now - last < Duration::seconds(THREAD_FLOOR_SECS) {
                    return Err(DomainError::TokenForbidden);
                }
            }
        }
        if let Some(last) = self.posts.last_post_at(ip, false).await? {
            if now - last < Duration::seconds(POST_FLOOR_SECS) {
                return Err(DomainError::TokenForbidden);
            }
        }
        Ok(())
    }

    #[instrument(skip(self, req), fields(op = ?req.op, files = req.image_tokens.len()))]
    pub async fn create_post(&self, req: PostRequest, ip: &str, now: DateTime<Utc>) -> Result<Post, DomainError> {
        // 1. Bans
        if self.bans.is_banned(ip) {
            return Err(DomainError::Banned);
        }

        // 2. Shape
        self.validate(&req)?;

        // 3. Target thread
        if let Some(op) = req.op {
            match self.posts.get_post(op).await? {
                Some(post) if post.is_thread() => {}
                _ => return Err(DomainError::NoThread),
            }
        }

        // 4. Rate floors
        self.check_floors(ip, req.op.is_none(), now).await?;

        // 5. Insert, consuming the post and image tokens
        let new_post = NewPost {
            op: req.op,
            ip: ip.to_string(),
            body: req.body,
            commands: req.commands,
            created_at: now,
        };
        let post = match self.posts.insert_post(&new_post, &req.post_token, &req.image_tokens).await {
            Ok(post) => post,
            Err(RepoError::NotFound(what)) => {
                debug!(%what, "post rejected");
                return Err(DomainError::InvalidToken);
            }
            Err(e) => return Err(e.into()),
        };
        info!(id = post.id, thread = post.op, "post created");
        Ok(post)
    }
}
