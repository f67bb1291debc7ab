//! Thin controllers: extract, delegate to the services, record the outcome.

use axum::extract::multipart::{Field, MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use domains::{DomainError, UploadReceipt};
use serde::Serialize;
use services::PostRequest;
use tracing::debug;

use super::client_ip::ClientIp;
use super::error::ApiError;
use super::AppState;

const OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct PostCreated {
    pub id: i64,
    pub op: i64,
}

fn finish<T>(state: &AppState, endpoint: &str, ip: &str, res: Result<T, DomainError>) -> Result<T, ApiError> {
    match res {
        Ok(v) => {
            state.metrics.record(endpoint, "ok");
            Ok(v)
        }
        Err(e) => {
            let err = ApiError::from(e).logged(ip);
            state.metrics.record(endpoint, err.code());
            Err(err)
        }
    }
}

// ── Upload ──────────────────────────────────────────────────────────────────

struct UploadForm {
    file: Bytes,
    /// Present on idol preview uploads
    idol: Option<String>,
}

/// The body limit surfaces as a multipart error with status 413.
fn multipart_error(e: MultipartError, otherwise: DomainError) -> DomainError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        DomainError::TooLarge
    } else {
        otherwise
    }
}

async fn read_file(field: &mut Field<'_>, max_size: usize) -> Result<Bytes, DomainError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| multipart_error(e, DomainError::UploadRead))?
    {
        if buf.len() + chunk.len() > max_size {
            return Err(DomainError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Only the first `files[]` part is read; later ones are skipped.
async fn read_form(mut multipart: Multipart, max_size: usize) -> Result<UploadForm, DomainError> {
    let mut file = None;
    let mut idol = None;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, DomainError::ParseForm))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("files[]") if file.is_none() => file = Some(read_file(&mut field, max_size).await?),
            Some("idol") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| multipart_error(e, DomainError::ParseForm))?;
                idol = Some(text.trim().to_string());
            }
            other => debug!(field = ?other, "ignoring form field"),
        }
    }
    Ok(UploadForm {
        file: file.ok_or(DomainError::NoFile)?,
        idol,
    })
}

async fn receive(state: &AppState, multipart: Multipart) -> Result<UploadReceipt, DomainError> {
    let form = read_form(multipart, state.ingest.max_size()).await?;
    let size = form.file.len();
    let receipt = match form.idol {
        Some(idol) => state.ingest.upload_idol_preview(&idol, form.file).await?,
        None => state.ingest.upload(form.file).await?,
    };
    state.metrics.record_upload_bytes(size);
    Ok(receipt)
}

/// POST /api/upload
pub async fn upload(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadReceipt>, ApiError> {
    let res = match multipart {
        Ok(m) => receive(&state, m).await,
        Err(_) => Err(DomainError::ParseForm),
    };
    finish(&state, "upload", &ip, res).map(Json)
}

// ── Posting ─────────────────────────────────────────────────────────────────

async fn mint_post_token(state: &AppState, ip: &str) -> Result<String, DomainError> {
    if state.bans.is_banned(ip) {
        return Err(DomainError::Banned);
    }
    state.tokens.mint_post(ip, Utc::now()).await
}

/// POST /api/post-token
pub async fn post_token(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
) -> Result<Json<TokenResponse>, ApiError> {
    let res = mint_post_token(&state, &ip).await;
    finish(&state, "post_token", &ip, res).map(|token| Json(TokenResponse { token }))
}

/// POST /api/post
pub async fn create_post(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    body: Result<Json<PostRequest>, JsonRejection>,
) -> Result<Json<PostCreated>, ApiError> {
    let res = match body {
        Ok(Json(req)) => state.posting.create_post(req, &ip, Utc::now()).await,
        Err(_) => Err(DomainError::ParseForm),
    };
    finish(&state, "post", &ip, res).map(|post| Json(PostCreated { id: post.id, op: post.op }))
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, OPENMETRICS)], body).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
