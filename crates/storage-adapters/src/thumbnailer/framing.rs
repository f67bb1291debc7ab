//! Child → parent success frame:
//! `[uvarint header_len][JSON ThumbHeader][raw thumbnail bytes]`.
//!
//! The varint is the unsigned LEB128 encoding (7 bits per byte, low group
//! first, high bit set on every byte except the last).

use domains::ThumbHeader;
use thiserror::Error;

/// Upper bound on a JSON header. Real headers are a few hundred bytes.
const MAX_HEADER_LEN: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,
    #[error("length prefix overflows u64")]
    VarintOverflow,
    #[error("header length {0} exceeds limit")]
    HeaderTooLong(u64),
    #[error("malformed header: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn put_uvarint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Reads a uvarint from the front of `buf`, returning the value and the
/// number of bytes consumed.
pub fn read_uvarint(buf: &[u8]) -> Result<(u64, usize), FrameError> {
    let mut value: u64 = 0;
    for (i, &b) in buf.iter().enumerate() {
        if i == 9 && b > 1 {
            return Err(FrameError::VarintOverflow);
        }
        if i > 9 {
            return Err(FrameError::VarintOverflow);
        }
        value |= u64::from(b & 0x7f) << (7 * i);
        if b < 0x80 {
            return Ok((value, i + 1));
        }
    }
    Err(FrameError::Truncated)
}

pub fn encode(header: &ThumbHeader, thumb: &[u8]) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(header)?;
    let mut out = Vec::with_capacity(json.len() + thumb.len() + 4);
    put_uvarint(&mut out, json.len() as u64);
    out.extend_from_slice(&json);
    out.extend_from_slice(thumb);
    Ok(out)
}

/// Splits a frame into its header and the trailing thumbnail bytes.
pub fn decode(buf: &[u8]) -> Result<(ThumbHeader, &[u8]), FrameError> {
    let (len, used) = read_uvarint(buf)?;
    if len > MAX_HEADER_LEN {
        return Err(FrameError::HeaderTooLong(len));
    }
    let rest = &buf[used..];
    let len = len as usize;
    if rest.len() < len {
        return Err(FrameError::Truncated);
    }
    let (json, thumb) = rest.split_at(len);
    Ok((serde_json::from_slice(json)?, thumb))
}
