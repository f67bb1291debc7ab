//! # Upload ingestion
//!
//! Hash, deduplicate, thumbnail and allocate an uploaded file, then hand
//! back an allocation token for post creation to redeem.
//!
//! The image row is inserted before any blob is written and the blobs are
//! written before the row commits. A failed blob write removes whatever was
//! written and rolls the row back, so a committed row always has its blobs.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use domains::{
    BlobStore, Dims, DomainError, FileType, IdolRepo, ImageCommon, ImageRepo, RepoError,
    ThumbError, Thumbnail, Thumbnailer, UploadReceipt,
};
use md5::Md5;
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::tokens::TokenManager;

pub struct IngestService {
    images: Arc<dyn ImageRepo>,
    idols: Arc<dyn IdolRepo>,
    store: Arc<dyn BlobStore>,
    thumbnailer: Arc<dyn Thumbnailer>,
    tokens: Arc<TokenManager>,
    max_size: usize,
}

/// How an upload ended up with its image row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocated {
    /// A row with this hash already existed.
    Existing,
    /// Lost the INSERT race against an identical upload.
    Raced,
    Created,
}

pub fn sha1_hex(src: &[u8]) -> String {
    hex::encode(Sha1::digest(src))
}

fn md5_hex(src: &[u8]) -> String {
    hex::encode(Md5::digest(src))
}

/// Builds the image row from a validated thumbnailer result.
pub fn classify(sha1: String, md5: String, size: u64, thumb: &Thumbnail) -> Result<ImageCommon, ThumbError> {
    let h = &thumb.header;
    let file_type = FileType::from_mime(&h.mime).ok_or(ThumbError::ProcessError)?;
    if h.has_audio && !h.has_video && file_type != FileType::Mp3 {
        return Err(ThumbError::UnsupportedTracks);
    }
    let thumb_type = if h.has_alpha { FileType::Png } else { FileType::Jpeg };

    Ok(ImageCommon {
        sha1,
        size,
        file_type,
        thumb_type,
        has_video: h.has_video,
        has_audio: h.has_audio,
        // Validated finite and at most a day long
        length: h.duration.round() as u32,
        title: h.title.clone(),
        md5: Some(md5),
        artist: h.artist.clone(),
        dims: Dims {
            src_width: h.src_width,
            src_height: h.src_height,
            thumb_width: h.width,
            thumb_height: h.height,
        },
    })
}

impl IngestService {
    pub fn new(
        images: Arc<dyn ImageRepo>,
        idols: Arc<dyn IdolRepo>,
        store: Arc<dyn BlobStore>,
        thumbnailer: Arc<dyn Thumbnailer>,
        tokens: Arc<TokenManager>,
        max_size: usize,
    ) -> Self {
        Self {
            images,
            idols,
            store,
            thumbnailer,
            tokens,
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Ingests `src` and mints an allocation token for it.
    #[instrument(skip_all, fields(size = src.len()))]
    pub async fn upload(&self, src: Bytes) -> Result<UploadReceipt, DomainError> {
        let (image, outcome) = self.ingest(src.clone()).await?;
        match self.tokens.mint_image(&image.sha1, Utc::now()).await {
            Ok(token) => Ok(UploadReceipt {
                sha1: image.sha1,
                token,
            }),
            Err(e) if outcome == Allocated::Existing => {
                if self.images.find_image(&image.sha1).await?.is_some() {
                    return Err(e);
                }
                // Collected between the dedup hit and the mint
                debug!(sha1 = %image.sha1, error = %e, "dedup hit was collected, ingesting again");
                let (image, _) = self.ingest(src).await?;
                let token = self.tokens.mint_image(&image.sha1, Utc::now()).await?;
                Ok(UploadReceipt {
                    sha1: image.sha1,
                    token,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Ingests a square JPEG and makes it the preview of idol `idol_id`.
    /// Every check runs before the token is minted.
    #[instrument(skip(self, src), fields(size = src.len()))]
    pub async fn upload_idol_preview(&self, idol_id: &str, src: Bytes) -> Result<UploadReceipt, DomainError> {
        let id = Uuid::parse_str(idol_id).map_err(|_| DomainError::BadUuid)?;
        let current = self.idols.idol_preview(id).await?.ok_or(DomainError::NoIdol)?;

        let (image, _) = self.ingest(src).await?;
        if image.file_type != FileType::Jpeg {
            return Err(DomainError::BadPreview);
        }
        if image.dims.src_width != image.dims.src_height {
            return Err(DomainError::BadPreviewDims);
        }
        if current.as_deref() == Some(image.sha1.as_str()) {
            return Err(DomainError::DupPreview);
        }

        self.idols.set_idol_preview(id, &image.sha1).await?;
        let token = self.tokens.mint_image(&image.sha1, Utc::now()).await?;
        info!(idol = %id, sha1 = %image.sha1, "idol preview updated");
        Ok(UploadReceipt {
            sha1: image.sha1,
            token,
        })
    }

    /// Everything up to the allocation token: size gate, hashing, dedup
    /// lookup and, on a miss, thumbnailing and allocation.
    pub async fn ingest(&self, src: Bytes) -> Result<(ImageCommon, Allocated), DomainError> {
        // 1. Size gate
        if src.len() > self.max_size {
            return Err(DomainError::TooLarge);
        }
        if src.is_empty() {
            return Err(DomainError::NoFile);
        }

        // 2. Content address
        let sha1 = sha1_hex(&src);

        // 3. Dedup lookup
        if let Some(existing) = self.images.find_image(&sha1).await? {
            debug!(%sha1, "dedup hit");
            return Ok((existing, Allocated::Existing));
        }

        // 4. Thumbnail; failures leave no trace
        let thumb = self.thumbnailer.thumbnail(src.clone()).await?;

        // 5. Classify
        let image = classify(sha1, md5_hex(&src), src.len() as u64, &thumb)?;

        // 6. Allocate
        let outcome = self.allocate(&image, src, thumb.data, Utc::now()).await?;
        if outcome == Allocated::Raced {
            // Continue with the winner's committed row, not our own classification
            let winner = self.images.find_image(&image.sha1).await?.ok_or_else(|| {
                DomainError::Internal(format!("image {} lost the insert race but is absent", image.sha1))
            })?;
            return Ok((winner, outcome));
        }
        Ok((image, outcome))
    }

    /// Inserts the row, writes the blobs and commits, in that order.
    #[instrument(skip_all, fields(sha1 = %image.sha1))]
    pub async fn allocate(
        &self,
        image: &ImageCommon,
        src: Bytes,
        thumb: Option<Bytes>,
        now: DateTime<Utc>,
    ) -> Result<Allocated, DomainError> {
        // a. INSERT inside a transaction
        let alloc = match self.images.begin_allocation(image, now).await {
            Ok(alloc) => alloc,
            Err(RepoError::Conflict) => {
                debug!("identical upload won the insert race");
                return Ok(Allocated::Raced);
            }
            Err(e) => return Err(e.into()),
        };

        // b. Blob pair
        let written = self
            .store
            .write(&image.sha1, image.file_type, image.thumb_type, src, thumb)
            .await;
        if let Err(write_err) = written {
            if let Err(e) = self.store.delete(&image.sha1, image.file_type, image.thumb_type).await {
                error!(error = %e, original = %write_err, "blob cleanup failed");
            }
            if let Err(e) = alloc.rollback().await {
                error!(error = %e, original = %write_err, "allocation rollback failed");
            }
            warn!(error = %write_err, "blob write failed, allocation rolled back");
            return Err(write_err.into());
        }

        // c. COMMIT
        alloc.commit().await?;
        info!(file_type = %image.file_type, size = image.size, "image allocated");
        Ok(Allocated::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use domains::{
        Allocation, MockBlobStore, MockIdolRepo, MockImageRepo, MockThumbnailer, MockTokenRepo,
        StoreError, ThumbHeader,
    };
    use std::sync::Mutex;

    /// Records commit/rollback into a shared log.
    struct LoggedAllocation(Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Allocation for LoggedAllocation {
        async fn commit(self: Box<Self>) -> Result<(), RepoError> {
            self.0.lock().unwrap().push("commit");
            Ok(())
        }
        async fn rollback(self: Box<Self>) -> Result<(), RepoError> {
            self.0.lock().unwrap().push("rollback");
            Ok(())
        }
    }

    fn jpeg_thumb() -> Thumbnail {
        Thumbnail {
            header: ThumbHeader {
                mime: "image/jpeg".into(),
                src_width: 1084,
                src_height: 881,
                width: 150,
                height: 121,
                ..ThumbHeader::default()
            },
            data: Some(Bytes::from_static(b"thumb")),
        }
    }

    fn tokens_accepting() -> Arc<TokenManager> {
        let mut repo = MockTokenRepo::new();
        repo.expect_insert_image_token().returning(|_| Ok(()));
        Arc::new(TokenManager::new(Arc::new(repo), 30))
    }

    struct Parts {
        images: MockImageRepo,
        idols: MockIdolRepo,
        store: MockBlobStore,
        thumbnailer: MockThumbnailer,
    }

    impl Parts {
        fn new() -> Self {
            Self {
                images: MockImageRepo::new(),
                idols: MockIdolRepo::new(),
                store: MockBlobStore::new(),
                thumbnailer: MockThumbnailer::new(),
            }
        }

        fn build(self, max_size: usize) -> IngestService {
            self.build_with_tokens(tokens_accepting(), max_size)
        }

        fn build_with_tokens(self, tokens: Arc<TokenManager>, max_size: usize) -> IngestService {
            IngestService::new(
                Arc::new(self.images),
                Arc::new(self.idols),
                Arc::new(self.store),
                Arc::new(self.thumbnailer),
                tokens,
                max_size,
            )
        }
    }

    #[test]
    fn sha1_is_lowercase_hex() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn classify_rounds_duration_and_picks_thumb_type() {
        let mut thumb = jpeg_thumb();
        thumb.header.has_alpha = true;
        thumb.header.mime = "image/png".into();
        thumb.header.duration = 2.6;
        let image = classify("s".into(), "m".into(), 10, &thumb).unwrap();
        assert_eq!(image.file_type, FileType::Png);
        assert_eq!(image.thumb_type, FileType::Png);
        assert_eq!(image.length, 3);
        assert_eq!(image.dims.thumb_width, 150);
    }

    #[test]
    fn audio_only_must_be_mp3() {
        let mut thumb = jpeg_thumb();
        thumb.header.has_audio = true;
        thumb.header.mime = "video/mp4".into();
        assert_eq!(
            classify("s".into(), "m".into(), 10, &thumb),
            Err(ThumbError::UnsupportedTracks)
        );
    }

    #[tokio::test]
    async fn oversized_upload_never_reaches_the_worker() {
        // No expectations on any port
        let svc = Parts::new().build(4);
        let err = svc.upload(Bytes::from_static(b"12345")).await.unwrap_err();
        assert!(matches!(err, DomainError::TooLarge));
    }

    #[tokio::test]
    async fn dedup_hit_skips_thumbnailing() {
        let mut parts = Parts::new();
        let sha1 = sha1_hex(b"same bytes");
        let image = classify(sha1.clone(), "m".into(), 10, &jpeg_thumb()).unwrap();
        parts
            .images
            .expect_find_image()
            .returning(move |_| Ok(Some(image.clone())));
        parts.thumbnailer.expect_thumbnail().never();

        let receipt = parts.build(1024).upload(Bytes::from_static(b"same bytes")).await.unwrap();
        assert_eq!(receipt.sha1, sha1);
        assert_eq!(receipt.token.len(), 86);
    }

    #[tokio::test]
    async fn dedup_hit_collected_before_the_mint_is_ingested_again() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut parts = Parts::new();
        let image = classify(sha1_hex(b"same bytes"), "m".into(), 10, &jpeg_thumb()).unwrap();
        let lookups = Arc::new(Mutex::new(0));
        parts.images.expect_find_image().times(3).returning(move |_| {
            let mut n = lookups.lock().unwrap();
            *n += 1;
            Ok((*n == 1).then(|| image.clone()))
        });
        let alloc_log = Arc::clone(&log);
        parts.images.expect_begin_allocation().times(1).returning(move |_, _| {
            Ok(Box::new(LoggedAllocation(Arc::clone(&alloc_log))))
        });
        parts.thumbnailer.expect_thumbnail().times(1).returning(|_| Ok(jpeg_thumb()));
        parts.store.expect_write().times(1).returning(|_, _, _, _, _| Ok(()));

        let mut repo = MockTokenRepo::new();
        let mut seq = mockall::Sequence::new();
        repo.expect_insert_image_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RepoError::NotFound("referenced row".into())));
        repo.expect_insert_image_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let tokens = Arc::new(TokenManager::new(Arc::new(repo), 30));

        let receipt = parts
            .build_with_tokens(tokens, 1024)
            .upload(Bytes::from_static(b"same bytes"))
            .await
            .unwrap();
        assert_eq!(receipt.sha1, sha1_hex(b"same bytes"));
        assert_eq!(*log.lock().unwrap(), vec!["commit"]);
    }

    #[tokio::test]
    async fn thumbnail_failure_writes_nothing() {
        let mut parts = Parts::new();
        parts.images.expect_find_image().returning(|_| Ok(None));
        parts.images.expect_begin_allocation().never();
        parts.store.expect_write().never();
        parts
            .thumbnailer
            .expect_thumbnail()
            .returning(|_| Err(ThumbError::Unsupported));

        let err = parts.build(1024).upload(Bytes::from_static(b"???")).await.unwrap_err();
        assert_eq!(err.code(), "unsupported");
    }

    #[tokio::test]
    async fn blob_failure_cleans_up_and_rolls_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut parts = Parts::new();
        parts.images.expect_find_image().returning(|_| Ok(None));
        let alloc_log = Arc::clone(&log);
        parts.images.expect_begin_allocation().returning(move |_, _| {
            alloc_log.lock().unwrap().push("insert");
            Ok(Box::new(LoggedAllocation(Arc::clone(&alloc_log))))
        });
        parts.thumbnailer.expect_thumbnail().returning(|_| Ok(jpeg_thumb()));
        let write_log = Arc::clone(&log);
        parts.store.expect_write().returning(move |_, _, _, _, _| {
            write_log.lock().unwrap().push("write");
            Err(StoreError::NoConnection)
        });
        let delete_log = Arc::clone(&log);
        parts.store.expect_delete().returning(move |_, _, _| {
            delete_log.lock().unwrap().push("delete");
            Ok(())
        });

        let err = parts.build(1024).upload(Bytes::from_static(b"jpeg")).await.unwrap_err();
        assert!(err.is_internal());
        assert_eq!(*log.lock().unwrap(), vec!["insert", "write", "delete", "rollback"]);
    }

    #[tokio::test]
    async fn row_is_inserted_before_blobs_and_committed_after() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut parts = Parts::new();
        parts.images.expect_find_image().returning(|_| Ok(None));
        let alloc_log = Arc::clone(&log);
        parts.images.expect_begin_allocation().returning(move |_, _| {
            alloc_log.lock().unwrap().push("insert");
            Ok(Box::new(LoggedAllocation(Arc::clone(&alloc_log))))
        });
        parts.thumbnailer.expect_thumbnail().returning(|_| Ok(jpeg_thumb()));
        let write_log = Arc::clone(&log);
        parts.store.expect_write().returning(move |_, _, _, _, thumb| {
            assert!(thumb.is_some());
            write_log.lock().unwrap().push("write");
            Ok(())
        });

        parts.build(1024).upload(Bytes::from_static(b"jpeg")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["insert", "write", "commit"]);
    }

    #[tokio::test]
    async fn lost_insert_race_is_a_dedup_hit() {
        let sha1 = sha1_hex(b"jpeg");
        let mut winner = classify(sha1.clone(), "m".into(), 4, &jpeg_thumb()).unwrap();
        winner.title = "committed first".into();

        let mut parts = Parts::new();
        let mut lookups = 0;
        parts.images.expect_find_image().times(2).returning(move |_| {
            lookups += 1;
            Ok((lookups > 1).then(|| winner.clone()))
        });
        parts
            .images
            .expect_begin_allocation()
            .returning(|_, _| Err(RepoError::Conflict));
        parts.thumbnailer.expect_thumbnail().returning(|_| Ok(jpeg_thumb()));
        parts.store.expect_write().never();

        let svc = parts.build(1024);
        let (image, outcome) = svc.ingest(Bytes::from_static(b"jpeg")).await.unwrap();
        assert_eq!(outcome, Allocated::Raced);
        assert_eq!(image.sha1, sha1);
        assert_eq!(image.title, "committed first");
    }

    #[test]
    fn video_header_keeps_its_tracks_and_length() {
        let thumb = Thumbnail {
            header: ThumbHeader {
                has_video: true,
                has_audio: true,
                mime: "video/webm".into(),
                src_width: 1280,
                src_height: 720,
                width: 200,
                height: 113,
                duration: 61.4,
                ..ThumbHeader::default()
            },
            data: Some(Bytes::from_static(b"thumb")),
        };
        let image = classify("s".into(), "m".into(), 10, &thumb).unwrap();
        assert_eq!(image.file_type, FileType::Webm);
        assert_eq!(image.thumb_type, FileType::Jpeg);
        assert!(image.has_video && image.has_audio);
        assert_eq!(image.length, 61);
    }

    mod idol_preview {
        use super::*;

        fn square_jpeg() -> Thumbnail {
            let mut t = jpeg_thumb();
            t.header.src_height = t.header.src_width;
            t
        }

        fn parts_with(thumb: Thumbnail, current: Option<String>) -> Parts {
            let mut parts = Parts::new();
            parts
                .idols
                .expect_idol_preview()
                .returning(move |_| Ok(Some(current.clone())));
            parts.images.expect_find_image().returning(|_| Ok(None));
            parts
                .images
                .expect_begin_allocation()
                .returning(|_, _| Ok(Box::new(LoggedAllocation(Arc::default()))));
            parts.thumbnailer.expect_thumbnail().returning(move |_| Ok(thumb.clone()));
            parts.store.expect_write().returning(|_, _, _, _, _| Ok(()));
            parts
        }

        const IDOL: &str = "6f1c1b1e-0b7e-4c7a-9d0e-1a2b3c4d5e6f";

        #[tokio::test]
        async fn bad_uuid_is_rejected_first() {
            let svc = Parts::new().build(1024);
            let err = svc.upload_idol_preview("nope", Bytes::from_static(b"x")).await.unwrap_err();
            assert_eq!(err.code(), "bad_uuid");
        }

        #[tokio::test]
        async fn missing_idol() {
            let mut parts = Parts::new();
            parts.idols.expect_idol_preview().returning(|_| Ok(None));
            let err = parts
                .build(1024)
                .upload_idol_preview(IDOL, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "no_idol");
        }

        #[tokio::test]
        async fn non_jpeg_and_non_square_are_rejected_without_a_token() {
            let mut png = square_jpeg();
            png.header.mime = "image/png".into();
            let mut parts = parts_with(png, None);
            parts.idols.expect_set_idol_preview().never();
            let err = parts
                .build(1024)
                .upload_idol_preview(IDOL, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "bad_preview");

            let mut parts = parts_with(jpeg_thumb(), None);
            parts.idols.expect_set_idol_preview().never();
            let err = parts
                .build(1024)
                .upload_idol_preview(IDOL, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "bad_preview_dims");
        }

        #[tokio::test]
        async fn same_preview_twice_is_a_duplicate() {
            let src = Bytes::from_static(b"square");
            let mut parts = parts_with(square_jpeg(), Some(sha1_hex(&src)));
            parts.idols.expect_set_idol_preview().never();
            let err = parts.build(1024).upload_idol_preview(IDOL, src).await.unwrap_err();
            assert_eq!(err.code(), "dup_preview");
        }

        #[tokio::test]
        async fn accepted_preview_is_set_then_tokenized() {
            let src = Bytes::from_static(b"square");
            let mut parts = parts_with(square_jpeg(), None);
            let expected = sha1_hex(&src);
            parts
                .idols
                .expect_set_idol_preview()
                .withf(move |_, sha1| sha1 == expected)
                .times(1)
                .returning(|_, _| Ok(()));
            let receipt = parts.build(1024).upload_idol_preview(IDOL, src).await.unwrap();
            assert_eq!(receipt.token.len(), 86);
        }
    }
}
