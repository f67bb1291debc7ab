//! PDF sources through PDFium. The first page is rendered as the thumbnail.

use domains::{ThumbError, ThumbHeader, MAX_TITLE_CHARS};
use pdfium_render::prelude::*;
use tracing::debug;

use super::child::{check_dims, encode_thumb, truncate_chars, ChildOptions};
use super::probe::Detected;

fn failed(e: PdfiumError) -> ThumbError {
    debug!(error = %e, "pdfium");
    ThumbError::ProcessError
}

/// Binds the PDFium shared library installed on the host.
fn bind() -> Result<Pdfium, ThumbError> {
    Ok(Pdfium::new(Pdfium::bind_to_system_library().map_err(failed)?))
}

pub fn process(src: &[u8], opts: &ChildOptions) -> Result<(ThumbHeader, Option<Vec<u8>>), ThumbError> {
    let pdfium = bind()?;
    let doc = pdfium.load_pdf_from_byte_slice(src, None).map_err(failed)?;
    let title = doc
        .metadata()
        .get(PdfDocumentMetadataTagType::Title)
        .map(|tag| tag.value().to_string())
        .unwrap_or_default();
    let artist = doc
        .metadata()
        .get(PdfDocumentMetadataTagType::Author)
        .map(|tag| truncate_chars(tag.value(), MAX_TITLE_CHARS));

    let page = doc.pages().get(0).map_err(failed)?;
    // Page size in points
    let (src_w, src_h) = (page.width().value.round(), page.height().value.round());
    if !(src_w >= 1.0 && src_h >= 1.0) {
        return Err(ThumbError::ProcessError);
    }
    let (src_width, src_height) = check_dims(src_w as u32, src_h as u32, opts)?;

    let side = opts.thumb_dimension as i32;
    let config = PdfRenderConfig::new()
        .set_target_width(side)
        .set_maximum_height(side);
    let img = page.render_with_config(&config).map_err(failed)?.as_image();
    let thumb = encode_thumb(img, opts)?;

    let header = ThumbHeader {
        has_video: false,
        has_audio: false,
        has_alpha: thumb.has_alpha,
        mime: Detected::Pdf.mime().to_string(),
        src_width,
        src_height,
        width: thumb.width,
        height: thumb.height,
        duration: 0.0,
        title: truncate_chars(&title, MAX_TITLE_CHARS),
        artist,
    };
    Ok((header, Some(thumb.data)))
}
