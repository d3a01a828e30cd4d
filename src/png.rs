//! Loading chunk sets from image files on disk.

use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use chrono::{DateTime, Utc};
use exif::{In, Reader, Tag, Value};
use flate2::read::ZlibDecoder;
use image::DynamicImage;
use tracing::debug;

use crate::chunks::{AlphaPlane, RawChunkSet};
use crate::constants::chunks::CHUNK_USER_COMMENT;
use crate::errors::MetadataError;

/// Eight-byte PNG file signature.
pub const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Source of chunk sets for the extraction service.
pub trait ChunkLoader: Send + Sync {
    /// Read the side-channel chunks (and alpha channel, when present) of `path`.
    fn load(&self, path: &Path) -> Result<RawChunkSet, MetadataError>;

    /// Modification time used to validate cached results.
    fn modified(&self, path: &Path) -> Result<Option<DateTime<Utc>>, MetadataError> {
        let metadata = fs::metadata(path)?;
        Ok(metadata.modified().ok().map(DateTime::<Utc>::from))
    }
}

/// Reads PNG text chunks, the EXIF `UserComment` tag and the alpha channel
/// of image files.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileChunkLoader;

impl FileChunkLoader {
    /// Loader with default settings.
    pub fn new() -> Self {
        Self
    }
}

impl ChunkLoader for FileChunkLoader {
    fn load(&self, path: &Path) -> Result<RawChunkSet, MetadataError> {
        let bytes = fs::read(path)?;
        let is_png = bytes.starts_with(PNG_SIGNATURE);
        let mut chunks = if is_png {
            read_png_text_chunks(&bytes)
        } else {
            RawChunkSet::new()
        };
        if chunks.get(CHUNK_USER_COMMENT).is_none() {
            if let Some(comment) = read_exif_user_comment(&bytes) {
                chunks = chunks.with_bytes(CHUNK_USER_COMMENT, comment);
            }
        }

        match image::load_from_memory(&bytes) {
            Ok(image) => {
                if let Some(alpha) = alpha_plane(&image) {
                    chunks = chunks.with_alpha(alpha);
                }
            }
            // Metadata is still useful when the pixel data is damaged.
            Err(err) if is_png || !chunks.is_empty() => {
                debug!(path = %path.display(), error = %err, "pixel data not decodable");
            }
            Err(err) => {
                return Err(MetadataError::Decode {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                });
            }
        }
        Ok(chunks)
    }
}

/// Collect `tEXt`, `zTXt` and `iTXt` chunks in file order.
///
/// Chunk CRCs are not verified; a truncated chunk ends the walk.
pub fn read_png_text_chunks(bytes: &[u8]) -> RawChunkSet {
    let mut chunks = RawChunkSet::new();
    let Some(mut rest) = bytes.strip_prefix(PNG_SIGNATURE.as_slice()) else {
        return chunks;
    };

    while rest.len() >= 12 {
        let length = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let kind = &rest[4..8];
        let Some(data) = rest.get(8..8 + length) else {
            debug!(length, "truncated png chunk");
            break;
        };
        let text = match kind {
            b"tEXt" => parse_text(data),
            b"zTXt" => parse_compressed_text(data),
            b"iTXt" => parse_international_text(data),
            b"IEND" => break,
            _ => None,
        };
        if let Some((keyword, value)) = text {
            chunks.insert_text(keyword, value);
        }
        // Skip data plus the trailing CRC.
        rest = rest.get(12 + length..).unwrap_or_default();
    }
    chunks
}

/// Raw EXIF `UserComment` bytes from a JPEG, WebP, TIFF or PNG `eXIf` container.
pub fn read_exif_user_comment(bytes: &[u8]) -> Option<Vec<u8>> {
    let exif = match Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(err) => {
            debug!(error = %err, "no exif data");
            return None;
        }
    };
    let field = exif.get_field(Tag::UserComment, In::PRIMARY)?;
    match &field.value {
        Value::Undefined(data, _) | Value::Byte(data) => Some(data.clone()),
        Value::Ascii(parts) => parts.first().cloned(),
        _ => None,
    }
}

fn split_keyword(data: &[u8]) -> Option<(String, &[u8])> {
    let nul = data.iter().position(|byte| *byte == 0)?;
    let keyword = latin1(&data[..nul]);
    (!keyword.is_empty()).then_some((keyword, &data[nul + 1..]))
}

fn parse_text(data: &[u8]) -> Option<(String, String)> {
    let (keyword, text) = split_keyword(data)?;
    Some((keyword, utf8_or_latin1(text)))
}

fn parse_compressed_text(data: &[u8]) -> Option<(String, String)> {
    let (keyword, rest) = split_keyword(data)?;
    let (method, compressed) = rest.split_first()?;
    if *method != 0 {
        return None;
    }
    let inflated = inflate(compressed)?;
    Some((keyword, utf8_or_latin1(&inflated)))
}

fn parse_international_text(data: &[u8]) -> Option<(String, String)> {
    let (keyword, rest) = split_keyword(data)?;
    let [flag, method, rest @ ..] = rest else {
        return None;
    };
    // Language tag and translated keyword are both NUL-terminated.
    let lang_end = rest.iter().position(|byte| *byte == 0)?;
    let rest = &rest[lang_end + 1..];
    let translated_end = rest.iter().position(|byte| *byte == 0)?;
    let text = &rest[translated_end + 1..];

    let text = match (*flag, *method) {
        (0, _) => String::from_utf8_lossy(text).into_owned(),
        (1, 0) => String::from_utf8_lossy(&inflate(text)?).into_owned(),
        _ => return None,
    };
    Some((keyword, text))
}

fn inflate(compressed: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    match ZlibDecoder::new(compressed).read_to_end(&mut out) {
        Ok(_) => Some(out),
        Err(err) => {
            debug!(error = %err, "compressed png text chunk not inflatable");
            None
        }
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| char::from(*byte)).collect()
}

fn utf8_or_latin1(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => latin1(bytes),
    }
}

/// Alpha plane of `image`, keeping the low byte of 16-bit samples.
pub fn alpha_plane(image: &DynamicImage) -> Option<AlphaPlane> {
    if !image.color().has_alpha() {
        return None;
    }
    let values: Vec<u8> = match image {
        DynamicImage::ImageRgba16(buffer) => buffer
            .pixels()
            .map(|pixel| (pixel[3] & 0x00ff) as u8)
            .collect(),
        DynamicImage::ImageLumaA16(buffer) => buffer
            .pixels()
            .map(|pixel| (pixel[1] & 0x00ff) as u8)
            .collect(),
        other => other.to_rgba8().pixels().map(|pixel| pixel[3]).collect(),
    };
    AlphaPlane::new(image.width(), image.height(), values).ok()
}
