//! Thumbnailer child logic: one source in, one header + thumbnail out.
//!
//! Runs inside the isolated `cutethumb` process. Deterministic and
//! stateless; every failure maps onto one of the known [`ThumbError`]
//! codes so the parent can classify it from the exit status alone.

use std::io::Cursor;

use domains::{ThumbError, ThumbHeader, MAX_SOURCE_DIMENSION, MAX_TITLE_CHARS, THUMB_DIMENSION};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, ImageReader, Limits};
use tracing::debug;

use super::probe::{self, Detected};

/// Tunables of the child. Defaults match the parent's validation limits.
#[derive(Debug, Clone)]
pub struct ChildOptions {
    pub max_source_dimension: u32,
    pub thumb_dimension: u32,
    pub jpeg_quality: u8,
}

impl Default for ChildOptions {
    fn default() -> Self {
        Self {
            max_source_dimension: MAX_SOURCE_DIMENSION,
            thumb_dimension: THUMB_DIMENSION,
            jpeg_quality: 90,
        }
    }
}

/// Probes `src` and synthesizes its thumbnail. Audio-only sources return
/// `None` for the thumbnail bytes.
pub fn process(src: &[u8], opts: &ChildOptions) -> Result<(ThumbHeader, Option<Vec<u8>>), ThumbError> {
    let detected = probe::sniff(src).ok_or(ThumbError::Unsupported)?;
    debug!(mime = detected.mime(), size = src.len(), "sniffed source");

    match detected {
        Detected::Jpeg | Detected::Png | Detected::Gif => still_image(src, detected, opts),
        Detected::Mp3 => mp3(src),
        Detected::Ogg { audio_only: true } | Detected::Mp4 { audio_only: true } => {
            Err(ThumbError::UnsupportedTracks)
        }
        Detected::Ogg { .. } | Detected::Mp4 { .. } | Detected::Webm => container(src, detected, opts),
        Detected::Pdf => document(src, opts),
    }
}

#[cfg(feature = "video")]
fn container(src: &[u8], detected: Detected, opts: &ChildOptions) -> Result<(ThumbHeader, Option<Vec<u8>>), ThumbError> {
    super::video::process(src, detected, opts)
}

#[cfg(not(feature = "video"))]
fn container(_: &[u8], detected: Detected, _: &ChildOptions) -> Result<(ThumbHeader, Option<Vec<u8>>), ThumbError> {
    debug!(mime = detected.mime(), "built without the video feature");
    Err(ThumbError::Unsupported)
}

#[cfg(feature = "documents")]
fn document(src: &[u8], opts: &ChildOptions) -> Result<(ThumbHeader, Option<Vec<u8>>), ThumbError> {
    super::document::process(src, opts)
}

#[cfg(not(feature = "documents"))]
fn document(_: &[u8], _: &ChildOptions) -> Result<(ThumbHeader, Option<Vec<u8>>), ThumbError> {
    debug!("built without the documents feature");
    Err(ThumbError::Unsupported)
}

/// A downscaled frame ready for the wire.
#[derive(Debug)]
pub(crate) struct Encoded {
    pub width: u16,
    pub height: u16,
    pub has_alpha: bool,
    pub data: Vec<u8>,
}

pub(crate) fn check_dims(src_w: u32, src_h: u32, opts: &ChildOptions) -> Result<(u16, u16), ThumbError> {
    if src_w > opts.max_source_dimension || src_h > opts.max_source_dimension {
        return Err(ThumbError::UnsupportedDimensions);
    }
    Ok((to_u16(src_w)?, to_u16(src_h)?))
}

/// Fits `img` within the thumbnail square. PNG when any pixel is
/// translucent, JPEG otherwise.
pub(crate) fn encode_thumb(img: DynamicImage, opts: &ChildOptions) -> Result<Encoded, ThumbError> {
    let side = opts.thumb_dimension;
    let thumb = if img.width() <= side && img.height() <= side {
        img
    } else {
        img.thumbnail(side, side)
    };

    let has_alpha = thumb.color().has_alpha() && thumb.to_rgba8().pixels().any(|p| p[3] < u8::MAX);
    let data = if has_alpha {
        encode_png(&thumb)?
    } else {
        encode_jpeg(&thumb, opts.jpeg_quality)?
    };
    Ok(Encoded {
        width: to_u16(thumb.width())?,
        height: to_u16(thumb.height())?,
        has_alpha,
        data,
    })
}

fn still_image(
    src: &[u8],
    detected: Detected,
    opts: &ChildOptions,
) -> Result<(ThumbHeader, Option<Vec<u8>>), ThumbError> {
    let format = match detected {
        Detected::Jpeg => ImageFormat::Jpeg,
        Detected::Png => ImageFormat::Png,
        _ => ImageFormat::Gif,
    };

    // 1. Dimensions from the header alone, before allocating pixels
    let (src_w, src_h) = ImageReader::with_format(Cursor::new(src), format)
        .into_dimensions()
        .map_err(|_| ThumbError::ProcessError)?;
    let (src_width, src_height) = check_dims(src_w, src_h, opts)?;

    // 2. Decode under the same limits
    let mut reader = ImageReader::with_format(Cursor::new(src), format);
    let mut limits = Limits::default();
    limits.max_image_width = Some(opts.max_source_dimension);
    limits.max_image_height = Some(opts.max_source_dimension);
    reader.limits(limits);
    let img = reader.decode().map_err(|_| ThumbError::ProcessError)?;

    // 3. Downscale, keeping aspect ratio
    let thumb = encode_thumb(img, opts)?;

    let header = ThumbHeader {
        has_video: false,
        has_audio: false,
        has_alpha: thumb.has_alpha,
        mime: detected.mime().to_string(),
        src_width,
        src_height,
        width: thumb.width,
        height: thumb.height,
        duration: 0.0,
        title: String::new(),
        artist: None,
    };
    Ok((header, Some(thumb.data)))
}

fn mp3(src: &[u8]) -> Result<(ThumbHeader, Option<Vec<u8>>), ThumbError> {
    let duration = probe::mp3_duration(src).ok_or(ThumbError::ProcessError)?;
    let tags = probe::read_id3(src);
    let header = ThumbHeader {
        has_video: false,
        has_audio: true,
        has_alpha: false,
        mime: Detected::Mp3.mime().to_string(),
        duration,
        title: truncate_chars(tags.title.as_deref().unwrap_or_default(), MAX_TITLE_CHARS),
        artist: tags.artist.map(|a| truncate_chars(&a, MAX_TITLE_CHARS)),
        ..ThumbHeader::default()
    };
    Ok((header, None))
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ThumbError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&img.to_rgb8())
        .map_err(|_| ThumbError::ProcessError)?;
    Ok(out)
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, ThumbError> {
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|_| ThumbError::ProcessError)?;
    // Lossless recompression; keep the plain encoding if it fails
    Ok(oxipng::optimize_from_memory(&out, &oxipng::Options::default()).unwrap_or(out))
}

fn to_u16(v: u32) -> Result<u16, ThumbError> {
    u16::try_from(v).map_err(|_| ThumbError::UnsupportedDimensions)
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn png_bytes(img: DynamicImage) -> Vec<u8> {
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png).unwrap();
        out
    }

    fn jpeg_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, Rgb([200, 10, 10]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
            .unwrap();
        out
    }

    #[test]
    fn large_jpeg_is_downscaled_to_jpeg() {
        let src = jpeg_bytes(1084, 881);
        let (header, data) = process(&src, &ChildOptions::default()).unwrap();
        assert_eq!(header.mime, "image/jpeg");
        assert_eq!((header.src_width, header.src_height), (1084, 881));
        assert!(header.width <= 200 && header.height <= 200);
        assert_eq!(header.width, 200);
        assert!(!header.has_alpha);
        let data = data.unwrap();
        assert!(data.starts_with(&[0xff, 0xd8]));
    }

    #[test]
    fn small_image_keeps_its_size() {
        let src = png_bytes(DynamicImage::ImageRgb8(RgbImage::new(40, 30)));
        let (header, _) = process(&src, &ChildOptions::default()).unwrap();
        assert_eq!((header.width, header.height), (40, 30));
    }

    #[test]
    fn transparent_png_yields_png_thumb() {
        let img = RgbaImage::from_pixel(300, 300, Rgba([0, 0, 0, 0]));
        let src = png_bytes(DynamicImage::ImageRgba8(img));
        let (header, data) = process(&src, &ChildOptions::default()).unwrap();
        assert!(header.has_alpha);
        assert!(data.unwrap().starts_with(b"\x89PNG"));
    }

    #[test]
    fn opaque_rgba_png_yields_jpeg_thumb() {
        let img = RgbaImage::from_pixel(50, 50, Rgba([1, 2, 3, 255]));
        let src = png_bytes(DynamicImage::ImageRgba8(img));
        let (header, data) = process(&src, &ChildOptions::default()).unwrap();
        assert!(!header.has_alpha);
        assert!(data.unwrap().starts_with(&[0xff, 0xd8]));
    }

    #[test]
    fn oversized_source_is_rejected_before_decoding() {
        let src = jpeg_bytes(64, 16);
        let opts = ChildOptions {
            max_source_dimension: 32,
            ..ChildOptions::default()
        };
        assert_eq!(process(&src, &opts), Err(ThumbError::UnsupportedDimensions));
    }

    #[test]
    fn unknown_bytes_are_unsupported() {
        assert_eq!(
            process(b"NOT_MEDIA!", &ChildOptions::default()),
            Err(ThumbError::Unsupported)
        );
    }

    #[test]
    fn corrupt_image_is_a_process_error() {
        let mut src = jpeg_bytes(10, 10);
        src.truncate(20);
        assert_eq!(process(&src, &ChildOptions::default()), Err(ThumbError::ProcessError));
    }

    #[cfg(not(feature = "video"))]
    #[test]
    fn containers_need_the_video_feature() {
        let webm = [0x1a, 0x45, 0xdf, 0xa3, 0x9f, 0x42, 0x82, 0x84, b'w', b'e', b'b', b'm'];
        assert_eq!(process(&webm, &ChildOptions::default()), Err(ThumbError::Unsupported));
    }

    #[cfg(not(feature = "documents"))]
    #[test]
    fn pdf_needs_the_documents_feature() {
        assert_eq!(
            process(b"%PDF-1.4\n%%EOF\n", &ChildOptions::default()),
            Err(ThumbError::Unsupported)
        );
    }

    #[test]
    fn audio_only_containers_have_unsupported_tracks() {
        assert_eq!(
            process(b"\0\0\0\x20ftypM4A \0\0\0\0", &ChildOptions::default()),
            Err(ThumbError::UnsupportedTracks)
        );
    }

    #[test]
    fn mp3_has_no_thumbnail() {
        let mut src = vec![0xff, 0xfb, 0x90, 0x64];
        src.resize(32_000, 0);
        let (header, data) = process(&src, &ChildOptions::default()).unwrap();
        assert!(header.has_audio && !header.has_video);
        assert_eq!(header.mime, "audio/mpeg");
        assert!((header.duration - 2.0).abs() < 1e-9);
        assert!(data.is_none());
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        assert_eq!(truncate_chars("ああああ", 2), "ああ");
        assert_eq!(truncate_chars("ab", 5), "ab");
    }
}
