//! Container sources (WEBM, MP4, Ogg) through FFmpeg.
//!
//! The first decodable video frame becomes the thumbnail. FFmpeg only opens
//! paths, so the source is spooled to a private temp file first.

use std::io::Write;

use domains::{ThumbError, ThumbHeader, MAX_TITLE_CHARS};
use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::media::Type;
use ffmpeg::software::scaling;
use image::{DynamicImage, RgbImage};
use tracing::debug;

use super::child::{check_dims, encode_thumb, truncate_chars, ChildOptions};
use super::probe::Detected;

/// `AV_TIME_BASE`: container durations are in microseconds.
const AV_TIME_BASE: f64 = 1_000_000.0;

fn failed(e: impl std::fmt::Display) -> ThumbError {
    debug!(error = %e, "ffmpeg");
    ThumbError::ProcessError
}

pub fn process(src: &[u8], detected: Detected, opts: &ChildOptions) -> Result<(ThumbHeader, Option<Vec<u8>>), ThumbError> {
    ffmpeg::init().map_err(failed)?;

    let mut spool = tempfile::NamedTempFile::new().map_err(failed)?;
    spool.write_all(src).map_err(failed)?;
    spool.flush().map_err(failed)?;
    let mut ictx = ffmpeg::format::input(&spool.path()).map_err(failed)?;

    let has_audio = ictx.streams().best(Type::Audio).is_some();
    let Some(input) = ictx.streams().best(Type::Video) else {
        return Err(if has_audio {
            ThumbError::UnsupportedTracks
        } else {
            ThumbError::Unsupported
        });
    };
    let index = input.index();
    let mut decoder = ffmpeg::codec::context::Context::from_parameters(input.parameters())
        .map_err(failed)?
        .decoder()
        .video()
        .map_err(failed)?;

    let (src_width, src_height) = check_dims(decoder.width(), decoder.height(), opts)?;
    let duration = if ictx.duration() > 0 {
        ictx.duration() as f64 / AV_TIME_BASE
    } else {
        0.0
    };
    let title = ictx.metadata().get("title").map(str::to_owned).unwrap_or_default();
    let artist = ictx.metadata().get("artist").map(str::to_owned);

    // 1. First frame
    let mut frame = ffmpeg::frame::Video::empty();
    let mut decoded = false;
    for (stream, packet) in ictx.packets() {
        if stream.index() != index {
            continue;
        }
        decoder.send_packet(&packet).map_err(failed)?;
        if decoder.receive_frame(&mut frame).is_ok() {
            decoded = true;
            break;
        }
    }
    if !decoded {
        decoder.send_eof().map_err(failed)?;
        decoder.receive_frame(&mut frame).map_err(failed)?;
    }

    // 2. To packed RGB
    let (w, h) = (frame.width(), frame.height());
    let mut scaler = scaling::Context::get(frame.format(), w, h, Pixel::RGB24, w, h, scaling::Flags::BILINEAR)
        .map_err(failed)?;
    let mut rgb = ffmpeg::frame::Video::empty();
    scaler.run(&frame, &mut rgb).map_err(failed)?;
    let img = to_image(&rgb)?;

    // 3. Thumbnail
    let thumb = encode_thumb(DynamicImage::ImageRgb8(img), opts)?;
    let header = ThumbHeader {
        has_video: true,
        has_audio,
        has_alpha: thumb.has_alpha,
        mime: detected.mime().to_string(),
        src_width,
        src_height,
        width: thumb.width,
        height: thumb.height,
        duration,
        title: truncate_chars(&title, MAX_TITLE_CHARS),
        artist: artist.map(|a| truncate_chars(&a, MAX_TITLE_CHARS)),
    };
    Ok((header, Some(thumb.data)))
}

/// Copies an RGB24 frame row by row, dropping the line padding.
fn to_image(rgb: &ffmpeg::frame::Video) -> Result<RgbImage, ThumbError> {
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let stride = rgb.stride(0);
    let plane = rgb.data(0);
    let mut buf = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        let row = plane
            .get(y * stride..y * stride + w * 3)
            .ok_or(ThumbError::ProcessError)?;
        buf.extend_from_slice(row);
    }
    RgbImage::from_raw(rgb.width(), rgb.height(), buf).ok_or(ThumbError::ProcessError)
}
