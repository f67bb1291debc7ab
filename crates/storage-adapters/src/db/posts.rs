//! Posts and the two small tables hanging off the posting path: bans and
//! idols.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domains::command::{decode_all, encode_all};
use domains::{Ban, BanRepo, IdolRepo, NewPost, Post, PostRepo, RepoError};
use sqlx::Row;
use uuid::Uuid;

use super::{from_millis, map_err, to_millis, SqliteStore};

#[async_trait]
impl PostRepo for SqliteStore {
    async fn last_post_at(&self, ip: &str, threads_only: bool) -> Result<Option<DateTime<Utc>>, RepoError> {
        let sql = if threads_only {
            "SELECT MAX(created_at) FROM posts WHERE ip = ? AND op = id"
        } else {
            "SELECT MAX(created_at) FROM posts WHERE ip = ?"
        };
        let ms: Option<i64> = sqlx::query_scalar(sql)
            .bind(ip)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        ms.map(from_millis).transpose()
    }

    async fn insert_post(
        &self,
        post: &NewPost,
        post_token: &str,
        image_tokens: &[String],
    ) -> Result<Post, RepoError> {
        let now = to_millis(post.created_at);
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        // 0. Post token, bound to the poster's address
        sqlx::query_scalar::<_, String>(
            "DELETE FROM post_tokens WHERE token = ? AND ip = ? AND expires_at > ? RETURNING ip",
        )
        .bind(post_token)
        .bind(&post.ip)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?
        .ok_or_else(|| RepoError::NotFound("post token".into()))?;

        // 1. Post row; a new thread is its own OP
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO posts (op, ip, body, commands, created_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(post.op.unwrap_or(0))
        .bind(&post.ip)
        .bind(&post.body)
        .bind(encode_all(&post.commands))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_err)?;

        let op = match post.op {
            Some(op) => op,
            None => {
                sqlx::query("UPDATE posts SET op = id WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_err)?;
                id
            }
        };

        // 2. Redeem every image token; any miss aborts the whole post
        let mut files = Vec::with_capacity(image_tokens.len());
        for (position, token) in image_tokens.iter().enumerate() {
            let sha1: Option<String> = sqlx::query_scalar(
                "DELETE FROM image_tokens WHERE token = ? AND expires_at > ? RETURNING sha1",
            )
            .bind(token)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?;
            let sha1 = sha1.ok_or_else(|| RepoError::NotFound("image token".into()))?;

            sqlx::query("INSERT INTO post_files (post_id, position, sha1) VALUES (?, ?, ?)")
                .bind(id)
                .bind(position as i64)
                .bind(&sha1)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
            files.push(sha1);
        }

        tx.commit().await.map_err(map_err)?;

        Ok(Post {
            id,
            op,
            ip: Some(post.ip.clone()),
            body: post.body.clone(),
            commands: post.commands.clone(),
            created_at: from_millis(now)?,
            files,
        })
    }

    async fn get_post(&self, id: i64) -> Result<Option<Post>, RepoError> {
        let Some(row) = sqlx::query("SELECT id, op, ip, body, commands, created_at FROM posts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
        else {
            return Ok(None);
        };

        let files: Vec<String> =
            sqlx::query_scalar("SELECT sha1 FROM post_files WHERE post_id = ? ORDER BY position")
                .bind(id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;

        let commands: Vec<u8> = row.try_get("commands").map_err(map_err)?;
        Ok(Some(Post {
            id: row.try_get("id").map_err(map_err)?,
            op: row.try_get("op").map_err(map_err)?,
            ip: row.try_get("ip").map_err(map_err)?,
            body: row.try_get("body").map_err(map_err)?,
            commands: decode_all(&commands).map_err(|e| RepoError::Backend(e.to_string()))?,
            created_at: from_millis(row.try_get("created_at").map_err(map_err)?)?,
            files,
        }))
    }

    async fn clear_ips_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError> {
        let res = sqlx::query("UPDATE posts SET ip = NULL WHERE ip IS NOT NULL AND created_at < ?")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl BanRepo for SqliteStore {
    async fn insert_ban(&self, ban: &Ban) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO bans (ip, reason, expires_at) VALUES (?, ?, ?)
             ON CONFLICT (ip) DO UPDATE SET reason = excluded.reason, expires_at = excluded.expires_at",
        )
        .bind(&ban.ip)
        .bind(&ban.reason)
        .bind(to_millis(ban.expires_at))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn active_bans(&self, now: DateTime<Utc>) -> Result<Vec<Ban>, RepoError> {
        let rows = sqlx::query("SELECT ip, reason, expires_at FROM bans WHERE expires_at > ?")
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter()
            .map(|row| {
                Ok(Ban {
                    ip: row.try_get("ip").map_err(map_err)?,
                    reason: row.try_get("reason").map_err(map_err)?,
                    expires_at: from_millis(row.try_get("expires_at").map_err(map_err)?)?,
                })
            })
            .collect()
    }

    async fn expire_bans(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let res = sqlx::query("DELETE FROM bans WHERE expires_at <= ?")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl IdolRepo for SqliteStore {
    async fn insert_idol(&self, id: Uuid) -> Result<(), RepoError> {
        sqlx::query("INSERT INTO idols (id) VALUES (?)")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn idol_preview(&self, id: Uuid) -> Result<Option<Option<String>>, RepoError> {
        sqlx::query_scalar::<_, Option<String>>("SELECT preview FROM idols WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn set_idol_preview(&self, id: Uuid, sha1: &str) -> Result<(), RepoError> {
        let res = sqlx::query("UPDATE idols SET preview = ? WHERE id = ?")
            .bind(sha1)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        if res.rows_affected() == 0 {
            return Err(RepoError::NotFound("idol".into()));
        }
        Ok(())
    }
}
