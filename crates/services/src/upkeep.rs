//! # Upkeep
//!
//! Background maintenance: token and ban expiry, collection of images no
//! post references, session expiry and post IP scrubbing. One task, two
//! tickers, stopped through a `CancellationToken`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use domains::{BlobStore, DomainError, ImageRepo, PostRepo};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bans::BanCache;
use crate::tokens::TokenManager;

/// Post IPs are kept this many days.
pub const IP_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub warmup: StdDuration,
    pub short: StdDuration,
    pub long: StdDuration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            warmup: StdDuration::from_secs(60),
            short: StdDuration::from_secs(5 * 60),
            long: StdDuration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub deleted: u64,
    /// Blob delete failed; the row is kept for the next pass
    pub skipped: u64,
    /// Referenced again between the scan and the delete
    pub kept: u64,
}

pub struct Upkeep {
    tokens: Arc<TokenManager>,
    images: Arc<dyn ImageRepo>,
    posts: Arc<dyn PostRepo>,
    store: Arc<dyn BlobStore>,
    bans: Arc<BanCache>,
    schedule: Schedule,
}

impl Upkeep {
    pub fn new(
        tokens: Arc<TokenManager>,
        images: Arc<dyn ImageRepo>,
        posts: Arc<dyn PostRepo>,
        store: Arc<dyn BlobStore>,
        bans: Arc<BanCache>,
        schedule: Schedule,
    ) -> Self {
        Self {
            tokens,
            images,
            posts,
            store,
            bans,
            schedule,
        }
    }

    /// Runs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let start = Instant::now() + self.schedule.warmup;
        let mut short = interval_at(start, self.schedule.short);
        let mut long = interval_at(start, self.schedule.long);
        short.set_missed_tick_behavior(MissedTickBehavior::Delay);
        long.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(warmup = ?self.schedule.warmup, "upkeep scheduled");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("upkeep stopped");
                    return;
                }
                _ = short.tick() => self.short_pass(Utc::now()).await,
                _ = long.tick() => self.long_pass(Utc::now()).await,
            }
        }
    }

    /// Every few minutes. Each step runs even if an earlier one failed.
    pub async fn short_pass(&self, now: DateTime<Utc>) {
        match self.tokens.sweep(now).await {
            Ok(r) => debug!(image_tokens = r.image_tokens, post_tokens = r.post_tokens, "tokens expired"),
            Err(e) => error!(error = %e, "token expiry failed"),
        }
        match self.bans.expire(now).await {
            Ok(n) => debug!(expired = n, "bans expired"),
            Err(e) => error!(error = %e, "ban expiry failed"),
        }
        match self.delete_unused_files(now).await {
            Ok(r) if r.deleted + r.skipped > 0 => {
                info!(deleted = r.deleted, skipped = r.skipped, "unused files collected");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "file collection failed"),
        }
    }

    /// Hourly.
    pub async fn long_pass(&self, now: DateTime<Utc>) {
        match self.tokens.sweep_sessions(now).await {
            Ok(n) => debug!(expired = n, "sessions expired"),
            Err(e) => error!(error = %e, "session expiry failed"),
        }
        match self.posts.clear_ips_before(now - Duration::days(IP_RETENTION_DAYS)).await {
            Ok(n) => debug!(cleared = n, "post IPs cleared"),
            Err(e) => error!(error = %e, "IP clearing failed"),
        }
    }

    /// Deletes the row inside a transaction, removes the blobs while the
    /// row is write-locked, then commits. A failed blob delete rolls the
    /// row back so the next pass retries.
    pub async fn delete_unused_files(&self, now: DateTime<Utc>) -> Result<GcReport, DomainError> {
        let mut report = GcReport::default();
        for image in self.images.unreferenced_images(now).await? {
            let Some(reclaim) = self.images.begin_reclaim(&image.sha1, now).await? else {
                report.kept += 1;
                continue;
            };
            if let Err(e) = self
                .store
                .delete(&image.sha1, image.file_type, image.thumb_type)
                .await
            {
                warn!(sha1 = %image.sha1, error = %e, "blob delete failed, keeping row");
                if let Err(e) = reclaim.rollback().await {
                    error!(sha1 = %image.sha1, error = %e, "reclaim rollback failed");
                }
                report.skipped += 1;
                continue;
            }
            reclaim.commit().await?;
            report.deleted += 1;
        }
        Ok(report)
    }
}
