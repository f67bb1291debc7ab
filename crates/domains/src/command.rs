//! Hash commands embedded in post bodies (`#d6`, `#flip`) and their results.
//!
//! The binary form is `[tag][payload]`: tag 0 is a dice roll followed by a
//! little-endian u64, tag 1 is a coin flip followed by a single 0/1 byte.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const TAG_ROLL: u8 = 0;
const TAG_FLIP: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Roll(u64),
    Flip(bool),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandDecodeError {
    #[error("unknown command tag {0}")]
    UnknownTag(u8),
    #[error("truncated command payload")]
    Truncated,
}

impl Command {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Command::Roll(n) => {
                out.push(TAG_ROLL);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Command::Flip(b) => {
                out.push(TAG_FLIP);
                out.push(u8::from(b));
            }
        }
    }

    /// Decodes one command from the front of `buf` and returns it together
    /// with the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CommandDecodeError> {
        let (&tag, rest) = buf.split_first().ok_or(CommandDecodeError::Truncated)?;
        match tag {
            TAG_ROLL => {
                let raw: [u8; 8] = rest
                    .get(..8)
                    .and_then(|s| s.try_into().ok())
                    .ok_or(CommandDecodeError::Truncated)?;
                Ok((Command::Roll(u64::from_le_bytes(raw)), 9))
            }
            TAG_FLIP => {
                let b = *rest.first().ok_or(CommandDecodeError::Truncated)?;
                Ok((Command::Flip(b != 0), 2))
            }
            other => Err(CommandDecodeError::UnknownTag(other)),
        }
    }
}

/// Encodes a list of commands back to back.
pub fn encode_all(commands: &[Command]) -> Vec<u8> {
    let mut out = Vec::with_capacity(commands.len() * 9);
    for c in commands {
        c.encode(&mut out);
    }
    out
}

pub fn decode_all(mut buf: &[u8]) -> Result<Vec<Command>, CommandDecodeError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let (cmd, used) = Command::decode(buf)?;
        out.push(cmd);
        buf = &buf[used..];
    }
    Ok(out)
}
