//! Content-addressed blob layout shared by every store backend:
//! `<kind>/<sha1[0:2]>/<sha1[2:]>.<ext>` relative to the store root.

use crate::models::FileType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Source,
    Thumb,
}

impl BlobKind {
    pub fn dir(self) -> &'static str {
        match self {
            BlobKind::Source => "src",
            BlobKind::Thumb => "thumb",
        }
    }
}

/// Relative key of a blob. `sha1` must be a 40 character hex digest.
pub fn blob_key(kind: BlobKind, sha1: &str, file_type: FileType) -> String {
    let (shard, rest) = match (sha1.get(..2), sha1.get(2..)) {
        (Some(shard), Some(rest)) => (shard, rest),
        // Too short, or the first char is multibyte
        _ => ("", sha1),
    };
    format!("{}/{}/{}.{}", kind.dir(), shard, rest, file_type.extension())
}

/// Keys of the source and (when present) thumbnail of an image.
pub fn blob_keys(sha1: &str, file_type: FileType, thumb_type: FileType) -> (String, Option<String>) {
    let src = blob_key(BlobKind::Source, sha1, file_type);
    let thumb = (file_type != FileType::Mp3).then(|| blob_key(BlobKind::Thumb, sha1, thumb_type));
    (src, thumb)
}

/// Whether `s` looks like a lowercase SHA-1 hex digest.
pub fn is_sha1_hex(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
