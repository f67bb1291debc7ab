//! Parent side of the thumbnailer IPC.
//!
//! One invocation of the child per thumbnail. Exit status 0 carries a
//! framed result on stdout, exit status 100 carries a known error string,
//! anything else is an OS-level failure whose stderr is logged.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use domains::{
    FileType, ThumbError, ThumbHeader, Thumbnail, Thumbnailer, MAX_SOURCE_DIMENSION,
    MAX_TITLE_CHARS, THUMB_DIMENSION,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, warn};

use super::child::truncate_chars;
use super::framing;

/// Longest duration accepted from the child, in seconds.
const MAX_DURATION_SECS: f64 = 24.0 * 60.0 * 60.0;

/// Spawns the `cutethumb` binary, optionally through `sudo -u <user>`.
#[derive(Debug, Clone)]
pub struct ProcessThumbnailer {
    program: PathBuf,
    isolation_user: Option<String>,
}

impl ProcessThumbnailer {
    pub fn new(program: impl Into<PathBuf>, isolation_user: Option<String>) -> Self {
        Self {
            program: program.into(),
            isolation_user,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = match &self.isolation_user {
            Some(user) => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-u").arg(user).arg(&self.program);
                cmd
            }
            None => Command::new(&self.program),
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Thumbnailer for ProcessThumbnailer {
    async fn thumbnail(&self, src: Bytes) -> Result<Thumbnail, ThumbError> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| ThumbError::Os(format!("spawn {}: {e}", self.program.display())))?;

        // Feed stdin from a separate task so a child that writes before it
        // has read everything cannot deadlock against us.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ThumbError::Os("child stdin not piped".into()))?;
        let feeder = tokio::spawn(async move {
            let res = stdin.write_all(&src).await;
            drop(stdin);
            res
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ThumbError::Os(format!("wait for thumbnailer: {e}")))?;

        match feeder.await {
            Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                warn!(error = %e, "failed to feed thumbnailer stdin");
            }
            Err(e) => warn!(error = %e, "thumbnailer stdin task panicked"),
            _ => {}
        }

        match output.status.code() {
            Some(0) => parse_success(&output.stdout),
            Some(ThumbError::EXIT_CODE) => {
                let msg = String::from_utf8_lossy(&output.stdout);
                match ThumbError::from_code(&msg) {
                    Some(err) => Err(err),
                    None => {
                        warn!(message = %msg, "thumbnailer reported an unknown error");
                        Err(ThumbError::ProcessError)
                    }
                }
            }
            other => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                error!(status = ?other, stderr = %stderr, "thumbnailer exited abnormally");
                Err(ThumbError::Os(format!("exit status {:?}", other)))
            }
        }
    }
}

fn parse_success(stdout: &[u8]) -> Result<Thumbnail, ThumbError> {
    let (header, thumb) = framing::decode(stdout).map_err(|e| {
        warn!(error = %e, "undecodable thumbnailer frame");
        ThumbError::ProcessError
    })?;
    let data = (!thumb.is_empty()).then(|| Bytes::copy_from_slice(thumb));
    validate(Thumbnail { header, data })
}

/// Checks every field of a header produced by the untrusted child.
pub fn validate(mut thumb: Thumbnail) -> Result<Thumbnail, ThumbError> {
    let h = &mut thumb.header;
    let reject = |why: &str| {
        warn!(reason = why, "rejecting thumbnailer header");
        Err(ThumbError::ProcessError)
    };

    let Some(file_type) = FileType::from_mime(&h.mime) else {
        return reject("unknown mime");
    };
    if u32::from(h.src_width) > MAX_SOURCE_DIMENSION || u32::from(h.src_height) > MAX_SOURCE_DIMENSION {
        return reject("source dimensions out of range");
    }
    if u32::from(h.width) > THUMB_DIMENSION || u32::from(h.height) > THUMB_DIMENSION {
        return reject("thumbnail dimensions out of range");
    }
    if !h.duration.is_finite() || h.duration < 0.0 || h.duration > MAX_DURATION_SECS {
        return reject("duration out of range");
    }
    if h.has_alpha && file_type == FileType::Mp3 {
        return reject("alpha on audio");
    }

    if file_type == FileType::Mp3 {
        // Audio carries no thumbnail; ignore anything trailing
        thumb.data = None;
    } else if thumb.data.is_none() || h.width == 0 || h.height == 0 {
        return reject("missing thumbnail");
    }

    h.title = truncate_chars(&h.title, MAX_TITLE_CHARS);
    h.artist = h.artist.take().map(|a| truncate_chars(&a, MAX_TITLE_CHARS));
    Ok(thumb)
}

/// Convenience used by the child binary and by tests: the success frame
/// for a processed source.
pub fn frame_for(header: &ThumbHeader, data: Option<&[u8]>) -> Result<Vec<u8>, framing::FrameError> {
    framing::encode(header, data.unwrap_or_default())
}
