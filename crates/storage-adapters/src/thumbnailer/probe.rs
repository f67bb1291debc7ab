//! Magic-byte sniffing and light container probing for the thumbnailer
//! child. Nothing here decodes pixel data.

/// What the sniffer recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detected {
    Jpeg,
    Png,
    Gif,
    Pdf,
    Webm,
    Mp4 { audio_only: bool },
    Mp3,
    Ogg { audio_only: bool },
}

impl Detected {
    pub fn mime(self) -> &'static str {
        match self {
            Detected::Jpeg => "image/jpeg",
            Detected::Png => "image/png",
            Detected::Gif => "image/gif",
            Detected::Pdf => "application/pdf",
            Detected::Webm => "video/webm",
            Detected::Mp4 { .. } => "video/mp4",
            Detected::Mp3 => "audio/mpeg",
            Detected::Ogg { .. } => "application/ogg",
        }
    }
}

pub fn sniff(src: &[u8]) -> Option<Detected> {
    if src.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some(Detected::Jpeg);
    }
    if src.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some(Detected::Png);
    }
    if src.starts_with(b"GIF87a") || src.starts_with(b"GIF89a") {
        return Some(Detected::Gif);
    }
    if src.starts_with(b"%PDF-") {
        return Some(Detected::Pdf);
    }
    if src.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
        return Some(Detected::Webm);
    }
    if src.get(4..8) == Some(&b"ftyp"[..]) {
        let brand = src.get(8..12).unwrap_or_default();
        let audio_only = matches!(brand, b"M4A " | b"M4B " | b"M4P ");
        return Some(Detected::Mp4 { audio_only });
    }
    if src.starts_with(b"OggS") {
        return Some(Detected::Ogg { audio_only: ogg_is_audio_only(src) });
    }
    if src.starts_with(b"ID3") || parse_frame_header(src).is_some() {
        return Some(Detected::Mp3);
    }
    None
}

/// An Ogg stream whose first page announces an audio codec and no Theora
/// video.
fn ogg_is_audio_only(src: &[u8]) -> bool {
    let head = &src[..src.len().min(4096)];
    let has = |needle: &[u8]| head.windows(needle.len()).any(|w| w == needle);
    let audio = has(b"\x01vorbis") || has(b"OpusHead") || has(b"\x7fFLAC") || has(b"Speex");
    audio && !has(b"\x80theora")
}

// ── MP3 ─────────────────────────────────────────────────────────────────────

/// Tags pulled from an ID3v2 header.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Id3Tags {
    pub title: Option<String>,
    pub artist: Option<String>,
}

fn syncsafe(b: &[u8]) -> usize {
    b.iter().fold(0usize, |acc, &x| (acc << 7) | usize::from(x & 0x7f))
}

/// Total size of a leading ID3v2 tag including its 10 byte header.
pub fn id3_len(src: &[u8]) -> usize {
    if src.len() < 10 || !src.starts_with(b"ID3") {
        return 0;
    }
    let footer = if src[5] & 0x10 != 0 { 10 } else { 0 };
    (10 + syncsafe(&src[6..10]) + footer).min(src.len())
}

pub fn read_id3(src: &[u8]) -> Id3Tags {
    let mut tags = Id3Tags::default();
    let end = id3_len(src);
    if end == 0 {
        return tags;
    }
    let major = src[3];
    let mut pos = 10;
    while pos + 10 <= end {
        let id = &src[pos..pos + 4];
        if id[0] == 0 {
            break;
        }
        let raw_size = &src[pos + 4..pos + 8];
        let size = if major >= 4 {
            syncsafe(raw_size)
        } else {
            raw_size.iter().fold(0usize, |acc, &x| (acc << 8) | usize::from(x))
        };
        let body_start = pos + 10;
        let body_end = body_start.saturating_add(size);
        if body_end > end {
            break;
        }
        let body = &src[body_start..body_end];
        match id {
            b"TIT2" => tags.title = decode_text_frame(body),
            b"TPE1" => tags.artist = decode_text_frame(body),
            _ => {}
        }
        pos = body_end;
    }
    tags
}

fn decode_text_frame(body: &[u8]) -> Option<String> {
    let (&encoding, text) = body.split_first()?;
    let decoded = match encoding {
        // ISO-8859-1 maps byte for byte onto the first 256 code points
        0 => text.iter().map(|&b| char::from(b)).collect(),
        1 | 2 => {
            let mut units: Vec<u16> = text
                .chunks_exact(2)
                .map(|c| {
                    if encoding == 2 {
                        u16::from_be_bytes([c[0], c[1]])
                    } else {
                        u16::from_le_bytes([c[0], c[1]])
                    }
                })
                .collect();
            if encoding == 1 {
                match units.first() {
                    Some(0xfeff) => {
                        units.remove(0);
                    }
                    Some(0xfffe) => {
                        units.remove(0);
                        units.iter_mut().for_each(|u| *u = u.swap_bytes());
                    }
                    _ => {}
                }
            }
            String::from_utf16_lossy(&units)
        }
        3 => String::from_utf8_lossy(text).into_owned(),
        _ => return None,
    };
    let trimmed = decoded.trim_matches(char::from(0)).trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// MPEG audio frame header fields needed for a duration estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    bitrate_kbps: u32,
}

const BITRATES_V1_L3: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L3: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

fn parse_frame_header(b: &[u8]) -> Option<FrameHeader> {
    if b.len() < 4 || b[0] != 0xff || b[1] & 0xe0 != 0xe0 {
        return None;
    }
    let version = (b[1] >> 3) & 0x03;
    let layer = (b[1] >> 1) & 0x03;
    // Layer III only; version 1 is reserved
    if layer != 0x01 || version == 0x01 {
        return None;
    }
    let bitrate_idx = usize::from(b[2] >> 4);
    let rate_idx = (b[2] >> 2) & 0x03;
    if bitrate_idx == 0 || bitrate_idx == 15 || rate_idx == 3 {
        return None;
    }
    let table = if version == 0x03 { &BITRATES_V1_L3 } else { &BITRATES_V2_L3 };
    Some(FrameHeader { bitrate_kbps: table[bitrate_idx] })
}

/// Offset of the first plausible Layer III frame header.
fn first_mpeg_frame(src: &[u8]) -> Option<usize> {
    (0..src.len().saturating_sub(3)).find(|&i| parse_frame_header(&src[i..]).is_some())
}

/// Duration estimate in seconds assuming a constant bitrate. `None` when no
/// frame header can be found after the ID3 tag.
pub fn mp3_duration(src: &[u8]) -> Option<f64> {
    let tag = id3_len(src);
    let audio = &src[tag..];
    let offset = first_mpeg_frame(audio)?;
    let header = parse_frame_header(&audio[offset..])?;
    let bytes = (audio.len() - offset) as f64;
    Some(bytes * 8.0 / (f64::from(header.bitrate_kbps) * 1000.0))
}
