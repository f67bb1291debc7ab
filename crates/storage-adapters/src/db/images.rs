use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use domains::{Allocation, Dims, FileType, ImageCommon, ImageRepo, RepoError, TokenKind};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use super::{map_err, to_millis, SqliteStore};

/// Rows younger than this are never collected, so an image committed a
/// moment ago survives until its allocation token is written.
fn collection_grace() -> Duration {
    Duration::from_std(TokenKind::ImageAlloc.default_ttl()).unwrap_or_else(|_| Duration::seconds(60))
}

const UNREFERENCED: &str = "
    NOT EXISTS (SELECT 1 FROM post_files pf WHERE pf.sha1 = images.sha1)
    AND NOT EXISTS (SELECT 1 FROM idols WHERE idols.preview = images.sha1)
    AND NOT EXISTS (
        SELECT 1 FROM image_tokens t WHERE t.sha1 = images.sha1 AND t.expires_at > ?1
    )
    AND images.created_at <= ?2";

pub(crate) fn image_from_row(row: &SqliteRow) -> Result<ImageCommon, RepoError> {
    let file_type: String = row.try_get("file_type").map_err(map_err)?;
    let thumb_type: String = row.try_get("thumb_type").map_err(map_err)?;
    let dim = |col: &str| -> Result<u16, RepoError> {
        let v: i64 = row.try_get(col).map_err(map_err)?;
        u16::try_from(v).map_err(|_| RepoError::Backend(format!("{col} out of range: {v}")))
    };
    let size: i64 = row.try_get("size").map_err(map_err)?;
    let length: i64 = row.try_get("length").map_err(map_err)?;

    Ok(ImageCommon {
        sha1: row.try_get("sha1").map_err(map_err)?,
        size: u64::try_from(size).map_err(|_| RepoError::Backend(format!("bad size {size}")))?,
        file_type: file_type.parse::<FileType>().map_err(RepoError::Backend)?,
        thumb_type: thumb_type.parse::<FileType>().map_err(RepoError::Backend)?,
        has_video: row.try_get("has_video").map_err(map_err)?,
        has_audio: row.try_get("has_audio").map_err(map_err)?,
        length: u32::try_from(length).map_err(|_| RepoError::Backend(format!("bad length {length}")))?,
        title: row.try_get("title").map_err(map_err)?,
        md5: row.try_get("md5").map_err(map_err)?,
        artist: row.try_get("artist").map_err(map_err)?,
        dims: Dims {
            src_width: dim("src_width")?,
            src_height: dim("src_height")?,
            thumb_width: dim("thumb_width")?,
            thumb_height: dim("thumb_height")?,
        },
    })
}

/// An open transaction over one `images` row. Dropping it rolls back.
pub struct SqliteAllocation {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl Allocation for SqliteAllocation {
    async fn commit(self: Box<Self>) -> Result<(), RepoError> {
        self.tx.commit().await.map_err(map_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepoError> {
        self.tx.rollback().await.map_err(map_err)
    }
}

#[async_trait]
impl ImageRepo for SqliteStore {
    async fn find_image(&self, sha1: &str) -> Result<Option<ImageCommon>, RepoError> {
        let row = sqlx::query("SELECT * FROM images WHERE sha1 = ?")
            .bind(sha1)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(image_from_row).transpose()
    }

    async fn begin_allocation(
        &self,
        image: &ImageCommon,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn Allocation>, RepoError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        sqlx::query(
            "INSERT INTO images (sha1, size, file_type, thumb_type, has_video, has_audio, length,
                title, md5, artist, src_width, src_height, thumb_width, thumb_height, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&image.sha1)
        .bind(i64::try_from(image.size).map_err(|_| RepoError::Backend("size overflows i64".into()))?)
        .bind(image.file_type.as_str())
        .bind(image.thumb_type.as_str())
        .bind(image.has_video)
        .bind(image.has_audio)
        .bind(i64::from(image.length))
        .bind(&image.title)
        .bind(&image.md5)
        .bind(&image.artist)
        .bind(i64::from(image.dims.src_width))
        .bind(i64::from(image.dims.src_height))
        .bind(i64::from(image.dims.thumb_width))
        .bind(i64::from(image.dims.thumb_height))
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        Ok(Box::new(SqliteAllocation { tx }))
    }

    async fn unreferenced_images(&self, now: DateTime<Utc>) -> Result<Vec<ImageCommon>, RepoError> {
        let rows = sqlx::query(&format!("SELECT * FROM images WHERE {UNREFERENCED}"))
            .bind(to_millis(now))
            .bind(to_millis(now - collection_grace()))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter().map(image_from_row).collect()
    }

    async fn begin_reclaim(
        &self,
        sha1: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Box<dyn Allocation>>, RepoError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        // Re-checks every reference; the delete takes the write lock
        let res = sqlx::query(&format!("DELETE FROM images WHERE sha1 = ?3 AND {UNREFERENCED}"))
            .bind(to_millis(now))
            .bind(to_millis(now - collection_grace()))
            .bind(sha1)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        if res.rows_affected() == 0 {
            debug!(sha1, "image referenced again, not reclaiming");
            tx.rollback().await.map_err(map_err)?;
            return Ok(None);
        }
        Ok(Some(Box::new(SqliteAllocation { tx })))
    }
}
