use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use domains::DomainError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// A pipeline failure on its way to the client as `{"error": code}`.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub DomainError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            e if e.is_internal() => StatusCode::INTERNAL_SERVER_ERROR,
            DomainError::TokenForbidden | DomainError::Banned => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Server-side failures never leak their detail.
    pub fn code(&self) -> &'static str {
        if self.status().is_server_error() {
            "internal"
        } else {
            self.0.code()
        }
    }

    /// Logs server-side failures with the client address.
    pub fn logged(self, ip: &str) -> Self {
        if self.status().is_server_error() {
            error!(ip, error = %self.0, "request failed");
        }
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.code() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::ThumbError;

    #[test]
    fn statuses_follow_the_error_class() {
        let cases = [
            (DomainError::TooLarge, StatusCode::BAD_REQUEST, "too_large"),
            (DomainError::Thumbnail(ThumbError::Unsupported), StatusCode::BAD_REQUEST, "unsupported"),
            (DomainError::DupPreview, StatusCode::BAD_REQUEST, "dup_preview"),
            (DomainError::InvalidToken, StatusCode::BAD_REQUEST, "invalid_token"),
            (DomainError::TokenForbidden, StatusCode::FORBIDDEN, "token_forbidden"),
            (DomainError::Banned, StatusCode::FORBIDDEN, "banned"),
            (DomainError::Internal("disk full".into()), StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            (
                DomainError::Thumbnail(ThumbError::Os("signal 9".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
            ),
        ];
        for (err, status, code) in cases {
            let err = ApiError(err);
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[tokio::test]
    async fn internal_detail_is_sanitized() {
        let resp = ApiError(DomainError::Internal("UNIQUE constraint failed: images.sha1".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], br#"{"error":"internal"}"#);
    }
}
