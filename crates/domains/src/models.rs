//! # Domain Models
//!
//! Content-addressed images, the thumbnailer's result record, posts and the
//! token records that bind them together.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::Command;

/// Titles longer than this many characters are truncated.
pub const MAX_TITLE_CHARS: usize = 300;

/// Largest accepted source width or height.
pub const MAX_SOURCE_DIMENSION: u32 = 12_000;

/// Thumbnails fit inside a square of this side.
pub const THUMB_DIMENSION: u32 = 200;

/// Codec tag of a stored source file or thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Jpeg,
    Png,
    Gif,
    Webm,
    Pdf,
    Mp4,
    Mp3,
    Ogg,
}

impl FileType {
    pub const ALL: [FileType; 8] = [
        FileType::Jpeg,
        FileType::Png,
        FileType::Gif,
        FileType::Webm,
        FileType::Pdf,
        FileType::Mp4,
        FileType::Mp3,
        FileType::Ogg,
    ];

    /// Canonical file extension used by the blob layout.
    pub fn extension(self) -> &'static str {
        match self {
            FileType::Jpeg => "jpg",
            FileType::Png => "png",
            FileType::Gif => "gif",
            FileType::Webm => "webm",
            FileType::Pdf => "pdf",
            FileType::Mp4 => "mp4",
            FileType::Mp3 => "mp3",
            FileType::Ogg => "ogg",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            FileType::Jpeg => "image/jpeg",
            FileType::Png => "image/png",
            FileType::Gif => "image/gif",
            FileType::Webm => "video/webm",
            FileType::Pdf => "application/pdf",
            FileType::Mp4 => "video/mp4",
            FileType::Mp3 => "audio/mpeg",
            FileType::Ogg => "application/ogg",
        }
    }

    /// Maps a MIME type reported by the thumbnailer onto a codec tag.
    /// Parameters (`; charset=...`) are ignored.
    pub fn from_mime(raw: &str) -> Option<Self> {
        let parsed: mime::Mime = raw.parse().ok()?;
        let essence = parsed.essence_str();
        Self::ALL.into_iter().find(|t| t.mime() == essence)
    }

    /// Only JPEG and PNG are ever produced as thumbnails.
    pub fn is_thumb_type(self) -> bool {
        matches!(self, FileType::Jpeg | FileType::Png)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Jpeg => "jpeg",
            FileType::Png => "png",
            FileType::Gif => "gif",
            FileType::Webm => "webm",
            FileType::Pdf => "pdf",
            FileType::Mp4 => "mp4",
            FileType::Mp3 => "mp3",
            FileType::Ogg => "ogg",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown file type: {s}"))
    }
}

/// Source and thumbnail dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dims {
    pub src_width: u16,
    pub src_height: u16,
    pub thumb_width: u16,
    pub thumb_height: u16,
}

/// An uploaded file, identified by the SHA-1 of its bytes.
/// Rows are immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCommon {
    /// 40 lowercase hex characters
    pub sha1: String,
    pub size: u64,
    pub file_type: FileType,
    pub thumb_type: FileType,
    pub has_video: bool,
    pub has_audio: bool,
    /// Whole seconds; 0 for still images
    pub length: u32,
    pub title: String,
    pub md5: Option<String>,
    pub artist: Option<String>,
    pub dims: Dims,
}

impl ImageCommon {
    /// MP3 uploads are the only files stored without a thumbnail.
    pub fn has_thumb(&self) -> bool {
        self.file_type != FileType::Mp3
    }
}

/// JSON header written by the thumbnailer child ahead of the raw thumbnail
/// bytes. Field names are part of the IPC wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ThumbHeader {
    pub has_video: bool,
    pub has_audio: bool,
    pub has_alpha: bool,
    pub mime: String,
    pub src_width: u16,
    pub src_height: u16,
    pub width: u16,
    pub height: u16,
    /// Seconds
    pub duration: f64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
}

/// Result of one thumbnailer run. `data` is `None` for audio-only files.
#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    pub header: ThumbHeader,
    pub data: Option<Bytes>,
}

/// Returned to the uploader; the token is later redeemed by post creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub sha1: String,
    pub token: String,
}

/// The three token families and their fixed shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    ImageAlloc,
    Post,
    Session,
}

impl TokenKind {
    /// Number of random bytes behind a token.
    pub fn byte_len(self) -> usize {
        match self {
            TokenKind::ImageAlloc => 64,
            TokenKind::Post => 15,
            TokenKind::Session => 128,
        }
    }

    /// Length of the unpadded base64 string.
    pub fn string_len(self) -> usize {
        (self.byte_len() * 4).div_ceil(3)
    }

    /// Lifetime of a freshly minted token. Session lifetimes are
    /// configurable and this is only their default.
    pub fn default_ttl(self) -> Duration {
        match self {
            TokenKind::ImageAlloc => Duration::from_secs(60),
            TokenKind::Post => Duration::from_secs(5 * 60),
            TokenKind::Session => Duration::from_secs(30 * 24 * 60 * 60),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::ImageAlloc => "image_alloc",
            TokenKind::Post => "post",
            TokenKind::Session => "session",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAllocToken {
    pub token: String,
    pub sha1: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostToken {
    pub token: String,
    pub ip: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub user_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// A post about to be inserted. `op = None` opens a new thread.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPost {
    pub op: Option<i64>,
    pub ip: String,
    pub body: String,
    pub commands: Vec<Command>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    /// Equal to `id` for the post that opened the thread
    pub op: i64,
    /// Cleared by upkeep once the post is old enough
    pub ip: Option<String>,
    pub body: String,
    pub commands: Vec<Command>,
    pub created_at: DateTime<Utc>,
    /// SHA-1 of every attached image, in attachment order
    pub files: Vec<String>,
}

impl Post {
    pub fn is_thread(&self) -> bool {
        self.id == self.op
    }
}

/// Represents a moderation action against an IP address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    pub ip: String,
    pub reason: String,
    pub expires_at: DateTime<Utc>,
}
