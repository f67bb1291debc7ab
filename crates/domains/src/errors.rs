//! # Error Taxonomy
//!
//! Shared vocabulary between the thumbnailer child, the parent process, the
//! persistence layer and the API surface. Every public failure carries a
//! stable string code; internal failures keep their detail for logging only.

use thiserror::Error;

/// Failures reported by the thumbnailer.
///
/// The first four cross the process boundary as plain strings on stdout
/// together with [`ThumbError::EXIT_CODE`]. `Os` is produced by the parent
/// for any other abnormal exit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ThumbError {
    #[error("unsupported")]
    Unsupported,
    #[error("unsupported_dimensions")]
    UnsupportedDimensions,
    #[error("unsupported_tracks")]
    UnsupportedTracks,
    #[error("process_error")]
    ProcessError,
    #[error("thumbnailer OS error: {0}")]
    Os(String),
}

impl ThumbError {
    /// Exit status of a child that failed with a known error.
    pub const EXIT_CODE: i32 = 100;

    pub fn code(&self) -> &'static str {
        match self {
            ThumbError::Unsupported => "unsupported",
            ThumbError::UnsupportedDimensions => "unsupported_dimensions",
            ThumbError::UnsupportedTracks => "unsupported_tracks",
            ThumbError::ProcessError => "process_error",
            ThumbError::Os(_) => "os_error",
        }
    }

    /// Parses the error string a child printed before exiting with
    /// [`ThumbError::EXIT_CODE`]. A trailing newline is tolerated.
    pub fn from_code(raw: &str) -> Option<Self> {
        match raw.trim_end_matches(['\n', '\r']) {
            "unsupported" => Some(ThumbError::Unsupported),
            "unsupported_dimensions" => Some(ThumbError::UnsupportedDimensions),
            "unsupported_tracks" => Some(ThumbError::UnsupportedTracks),
            "process_error" => Some(ThumbError::ProcessError),
            _ => None,
        }
    }
}

/// Blob store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The remote transport is currently disconnected; a reconnect is in
    /// progress.
    #[error("no connection to file server")]
    NoConnection,

    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote store error: {0}")]
    Remote(String),
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum RepoError {
    /// A primary or unique key already exists.
    #[error("unique key conflict")]
    Conflict,

    /// A row the operation depends on is missing.
    #[error("{0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Backend(String),
}

/// The primary error type surfaced by the pipeline services.
#[derive(Debug, Error)]
pub enum DomainError {
    // ── Input ────────────────────────────────────────────────────────────
    #[error("too_large")]
    TooLarge,
    #[error("upload_read")]
    UploadRead,
    #[error("parse_form")]
    ParseForm,
    #[error("bad_uuid")]
    BadUuid,
    #[error("no_file")]
    NoFile,
    #[error("too_many_files")]
    TooManyFiles,

    // ── Thumbnailer ──────────────────────────────────────────────────────
    #[error(transparent)]
    Thumbnail(#[from] ThumbError),

    // ── Tokens ───────────────────────────────────────────────────────────
    #[error("invalid_token")]
    InvalidToken,
    #[error("token_forbidden")]
    TokenForbidden,

    // ── Posting ──────────────────────────────────────────────────────────
    #[error("no_content")]
    NoContent,
    #[error("banned")]
    Banned,
    #[error("no_thread")]
    NoThread,

    // ── Idol previews ────────────────────────────────────────────────────
    #[error("bad_preview")]
    BadPreview,
    #[error("bad_preview_dims")]
    BadPreviewDims,
    #[error("dup_preview")]
    DupPreview,
    #[error("no_idol")]
    NoIdol,

    /// Unexpected DB or store failure. The message is for logs only.
    #[error("internal: {0}")]
    Internal(String),
}

impl DomainError {
    /// Stable code returned to clients.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::TooLarge => "too_large",
            DomainError::UploadRead => "upload_read",
            DomainError::ParseForm => "parse_form",
            DomainError::BadUuid => "bad_uuid",
            DomainError::NoFile => "no_file",
            DomainError::TooManyFiles => "too_many_files",
            DomainError::Thumbnail(ThumbError::Os(_)) => "internal",
            DomainError::Thumbnail(e) => e.code(),
            DomainError::InvalidToken => "invalid_token",
            DomainError::TokenForbidden => "token_forbidden",
            DomainError::NoContent => "no_content",
            DomainError::Banned => "banned",
            DomainError::NoThread => "no_thread",
            DomainError::BadPreview => "bad_preview",
            DomainError::BadPreviewDims => "bad_preview_dims",
            DomainError::DupPreview => "dup_preview",
            DomainError::NoIdol => "no_idol",
            DomainError::Internal(_) => "internal",
        }
    }

    /// Whether the failure is the server's fault. Such errors are logged in
    /// full and reported to the client only as `internal`.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            DomainError::Internal(_) | DomainError::Thumbnail(ThumbError::Os(_))
        )
    }
}

impl From<RepoError> for DomainError {
    fn from(err: RepoError) -> Self {
        DomainError::Internal(err.to_string())
    }
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        DomainError::Internal(err.to_string())
    }
}
