use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domains::{ImageAllocToken, ImageCommon, PostToken, RepoError, SessionToken, TokenRepo};

use super::images::image_from_row;
use super::{map_err, to_millis, SqliteStore};

#[async_trait]
impl TokenRepo for SqliteStore {
    async fn insert_image_token(&self, token: &ImageAllocToken) -> Result<(), RepoError> {
        sqlx::query("INSERT INTO image_tokens (token, sha1, expires_at) VALUES (?, ?, ?)")
            .bind(&token.token)
            .bind(&token.sha1)
            .bind(to_millis(token.expires_at))
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn take_image_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ImageCommon>, RepoError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let sha1: Option<String> = sqlx::query_scalar(
            "DELETE FROM image_tokens WHERE token = ? AND expires_at > ? RETURNING sha1",
        )
        .bind(token)
        .bind(to_millis(now))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?;

        let Some(sha1) = sha1 else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT * FROM images WHERE sha1 = ?")
            .bind(&sha1)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?;
        let image = row.as_ref().map(image_from_row).transpose()?;

        tx.commit().await.map_err(map_err)?;
        Ok(image)
    }

    async fn delete_image_token(&self, token: &str) -> Result<(), RepoError> {
        sqlx::query("DELETE FROM image_tokens WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn insert_post_token(&self, token: &PostToken, now: DateTime<Utc>) -> Result<bool, RepoError> {
        // Single statement, so two racing mints for one IP cannot both land
        let res = sqlx::query(
            "INSERT INTO post_tokens (token, ip, expires_at)
             SELECT ?1, ?2, ?3
             WHERE NOT EXISTS (
                 SELECT 1 FROM post_tokens WHERE ip = ?2 AND expires_at > ?4
             )",
        )
        .bind(&token.token)
        .bind(&token.ip)
        .bind(to_millis(token.expires_at))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn take_post_token(&self, token: &str, now: DateTime<Utc>) -> Result<Option<String>, RepoError> {
        sqlx::query_scalar("DELETE FROM post_tokens WHERE token = ? AND expires_at > ? RETURNING ip")
            .bind(token)
            .bind(to_millis(now))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn insert_session(&self, session: &SessionToken) -> Result<(), RepoError> {
        sqlx::query("INSERT INTO sessions (token, user_id, expires_at) VALUES (?, ?, ?)")
            .bind(&session.token)
            .bind(&session.user_id)
            .bind(to_millis(session.expires_at))
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn session_user(&self, token: &str, now: DateTime<Utc>) -> Result<Option<String>, RepoError> {
        sqlx::query_scalar("SELECT user_id FROM sessions WHERE token = ? AND expires_at > ?")
            .bind(token)
            .bind(to_millis(now))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn delete_session(&self, token: &str) -> Result<(), RepoError> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn expire_image_tokens(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        self.expire("image_tokens", now).await
    }

    async fn expire_post_tokens(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        self.expire("post_tokens", now).await
    }

    async fn expire_sessions(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        self.expire("sessions", now).await
    }
}

impl SqliteStore {
    /// `table` is always one of the token tables named above.
    async fn expire(&self, table: &'static str, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let res = sqlx::query(&format!("DELETE FROM {table} WHERE expires_at <= ?"))
            .bind(to_millis(now))
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected())
    }
}
