//! Shared fixtures: a real SQLite database in memory, a local blob store in
//! a temp directory and the thumbnailer child logic run in-process.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use domains::{blob_keys, BlobStore, FileType, ImageCommon, ImageRepo, StoreError, ThumbError, Thumbnail, Thumbnailer};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use services::{BanCache, IngestService, PostingService, TokenManager, WorkerPool};
use storage_adapters::thumbnailer::{child, process, ChildOptions};
use storage_adapters::{LocalStore, SqliteStore};
use tempfile::TempDir;

pub const MAX_SIZE: usize = 1 << 20;
pub const MAX_FILES: usize = 4;
pub const IP: &str = "203.0.113.10";

// ── Thumbnailer ─────────────────────────────────────────────────────────────

/// Runs the child logic on a blocking thread instead of a subprocess.
#[derive(Default)]
pub struct InProcessThumbnailer {
    calls: AtomicUsize,
}

impl InProcessThumbnailer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Thumbnailer for InProcessThumbnailer {
    async fn thumbnail(&self, src: Bytes) -> Result<Thumbnail, ThumbError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (header, data) = tokio::task::spawn_blocking(move || child::process(&src, &ChildOptions::default()))
            .await
            .map_err(|e| ThumbError::Os(e.to_string()))??;
        process::validate(Thumbnail {
            header,
            data: data.map(Bytes::from),
        })
    }
}

// ── Blob store ──────────────────────────────────────────────────────────────

/// Local store that can be told to fail after the source blob is written.
pub struct FlakyStore {
    inner: LocalStore,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalStore::new(root),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for FlakyStore {
    async fn write(
        &self,
        sha1: &str,
        file_type: FileType,
        thumb_type: FileType,
        src: Bytes,
        thumb: Option<Bytes>,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            self.inner.write(sha1, file_type, thumb_type, src, None).await?;
            return Err(StoreError::Remote("thumbnail write refused".into()));
        }
        self.inner.write(sha1, file_type, thumb_type, src, thumb).await
    }

    async fn delete(&self, sha1: &str, file_type: FileType, thumb_type: FileType) -> Result<(), StoreError> {
        self.inner.delete(sha1, file_type, thumb_type).await
    }

    fn serve_root(&self) -> Option<PathBuf> {
        self.inner.serve_root()
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

pub struct Harness {
    pub db: Arc<SqliteStore>,
    pub blobs: TempDir,
    pub store: Arc<FlakyStore>,
    pub thumbnailer: Arc<InProcessThumbnailer>,
    pub tokens: Arc<TokenManager>,
    pub bans: Arc<BanCache>,
    pub ingest: Arc<IngestService>,
    pub posting: Arc<PostingService>,
}

impl Harness {
    pub async fn new() -> Self {
        let db = Arc::new(SqliteStore::in_memory().await.unwrap());
        let blobs = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(blobs.path()));
        let thumbnailer = Arc::new(InProcessThumbnailer::default());
        let pool = Arc::new(WorkerPool::spawn(thumbnailer.clone(), 2));
        let tokens = Arc::new(TokenManager::new(db.clone(), 30));
        let bans = Arc::new(BanCache::new(db.clone()));
        let ingest = Arc::new(IngestService::new(
            db.clone(),
            db.clone(),
            store.clone(),
            pool,
            tokens.clone(),
            MAX_SIZE,
        ));
        let posting = Arc::new(PostingService::new(db.clone(), bans.clone(), MAX_FILES));
        Self {
            db,
            blobs,
            store,
            thumbnailer,
            tokens,
            bans,
            ingest,
            posting,
        }
    }

    pub async fn image(&self, sha1: &str) -> Option<ImageCommon> {
        self.db.find_image(sha1).await.unwrap()
    }

    pub fn src_path(&self, image: &ImageCommon) -> PathBuf {
        let (src, _) = blob_keys(&image.sha1, image.file_type, image.thumb_type);
        self.blobs.path().join(src)
    }

    pub fn thumb_path(&self, image: &ImageCommon) -> Option<PathBuf> {
        let (_, thumb) = blob_keys(&image.sha1, image.file_type, image.thumb_type);
        thumb.map(|t| self.blobs.path().join(t))
    }

    /// Source and thumbnail are both on disk.
    pub fn has_blobs(&self, image: &ImageCommon) -> bool {
        self.src_path(image).is_file() && self.thumb_path(image).map_or(true, |p| p.is_file())
    }

    /// Every file below the blob root.
    pub fn blob_count(&self) -> usize {
        fn walk(dir: &Path) -> usize {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return 0;
            };
            entries
                .flatten()
                .map(|e| {
                    let path = e.path();
                    if path.is_dir() {
                        walk(&path)
                    } else {
                        1
                    }
                })
                .sum()
        }
        walk(self.blobs.path())
    }
}

// ── Sources ─────────────────────────────────────────────────────────────────

fn encode(img: DynamicImage, format: ImageFormat) -> Bytes {
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), format).unwrap();
    Bytes::from(out)
}

/// Solid-colour JPEG. Sources of different dimensions hash differently.
pub fn jpeg(width: u32, height: u32) -> Bytes {
    encode(
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([40, 80, 160]))),
        ImageFormat::Jpeg,
    )
}

/// Fully transparent PNG.
pub fn transparent_png(width: u32, height: u32) -> Bytes {
    encode(
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]))),
        ImageFormat::Png,
    )
}

pub fn sha1_of(src: &[u8]) -> String {
    services::ingest::sha1_hex(src)
}
