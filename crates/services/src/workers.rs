//! # Thumbnailing worker pool
//!
//! N long-lived workers share one request channel. Each request carries its
//! own reply channel, so callers only ever see their own result. The channel
//! holds a single pending job; further submitters wait for a free slot
//! instead of being rejected.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use domains::{ThumbError, Thumbnail, Thumbnailer};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

struct Job {
    src: Bytes,
    reply: oneshot::Sender<Result<Thumbnail, ThumbError>>,
}

/// Bounds concurrent thumbnailing to the number of workers.
#[derive(Clone)]
pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
}

impl WorkerPool {
    /// Spawns `workers` tasks (at least one) that forward jobs to `backend`.
    /// Must be called inside a tokio runtime.
    pub fn spawn(backend: Arc<dyn Thumbnailer>, workers: usize) -> Self {
        let (jobs, rx) = mpsc::channel::<Job>(1);
        let rx = Arc::new(Mutex::new(rx));
        let workers = workers.max(1);
        for id in 0..workers {
            tokio::spawn(worker(id, Arc::clone(&backend), Arc::clone(&rx)));
        }
        info!(workers, "thumbnail workers started");
        Self { jobs }
    }
}

async fn worker(id: usize, backend: Arc<dyn Thumbnailer>, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        // Only the idle worker holding the lock waits on the channel
        let job = rx.lock().await.recv().await;
        let Some(job) = job else {
            debug!(worker = id, "job channel closed");
            return;
        };
        let res = backend.thumbnail(job.src).await;
        // The caller may have given up; its result is simply discarded
        let _ = job.reply.send(res);
    }
}

#[async_trait]
impl Thumbnailer for WorkerPool {
    async fn thumbnail(&self, src: Bytes) -> Result<Thumbnail, ThumbError> {
        let (reply, result) = oneshot::channel();
        self.jobs
            .send(Job { src, reply })
            .await
            .map_err(|_| ThumbError::Os("thumbnail workers stopped".into()))?;
        result
            .await
            .map_err(|_| ThumbError::Os("thumbnail worker dropped the request".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use domains::ThumbHeader;

    /// Echoes the source length back as the width and tracks peak
    /// concurrency.
    #[derive(Default)]
    struct Slow {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Thumbnailer for Slow {
        async fn thumbnail(&self, src: Bytes) -> Result<Thumbnail, ThumbError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if src.is_empty() {
                return Err(ThumbError::Unsupported);
            }
            Ok(Thumbnail {
                header: ThumbHeader {
                    width: src.len() as u16,
                    ..ThumbHeader::default()
                },
                data: None,
            })
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_worker_count() {
        let backend = Arc::new(Slow::default());
        let pool = WorkerPool::spawn(backend.clone(), 2);

        let calls = (1..=8).map(|n| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.thumbnail(Bytes::from(vec![0u8; n])).await })
        });
        let results = join_all(calls.collect()).await;

        // Every caller got its own result back
        for (i, res) in results.into_iter().enumerate() {
            assert_eq!(res.unwrap().header.width as usize, i + 1);
        }
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn errors_are_delivered_to_the_caller() {
        let pool = WorkerPool::spawn(Arc::new(Slow::default()), 1);
        assert_eq!(pool.thumbnail(Bytes::new()).await, Err(ThumbError::Unsupported));
    }

    async fn join_all(
        handles: Vec<tokio::task::JoinHandle<Result<Thumbnail, ThumbError>>>,
    ) -> Vec<Result<Thumbnail, ThumbError>> {
        let mut out = Vec::with_capacity(handles.len());
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    }
}
