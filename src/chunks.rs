//! Side-channel chunk sets handed over by the image loader.
//!
//! A `RawChunkSet` is the read-only input of the whole pipeline: named text or
//! byte chunks in file order plus an optional alpha-channel accessor.

use std::fmt;
use std::sync::Arc;

use image::{GrayAlphaImage, RgbaImage};
use indexmap::IndexMap;

use crate::constants::chunks::{
    CHUNK_PARAMETERS, CHUNK_USER_COMMENT, USER_COMMENT_ASCII_HEADER, USER_COMMENT_PRINTABLE_RATIO,
    USER_COMMENT_UNICODE_HEADER,
};
use crate::errors::MetadataError;
use crate::types::ChunkName;

/// Read access to a single alpha channel.
///
/// `get` must be valid for every `x < width()` and `y < height()`; only the
/// least-significant bit of the returned value is consumed.
pub trait AlphaChannel: Send + Sync {
    /// Channel width in pixels.
    fn width(&self) -> u32;
    /// Channel height in pixels.
    fn height(&self) -> u32;
    /// Alpha value at `(x, y)`.
    fn get(&self, x: u32, y: u32) -> u8;

    /// Total pixel count, computed without overflow.
    fn pixel_count(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }
}

/// Owned row-major alpha plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlphaPlane {
    width: u32,
    height: u32,
    values: Vec<u8>,
}

impl AlphaPlane {
    /// Wrap `values` (row-major, `width * height` entries) as an alpha plane.
    pub fn new(width: u32, height: u32, values: Vec<u8>) -> Result<Self, MetadataError> {
        let expected = (width as usize).checked_mul(height as usize);
        if expected != Some(values.len()) {
            return Err(MetadataError::InvalidDimensions {
                width,
                height,
                len: values.len(),
            });
        }
        Ok(Self {
            width,
            height,
            values,
        })
    }

    /// Fully opaque plane of the given size.
    pub fn opaque(width: u32, height: u32) -> Result<Self, MetadataError> {
        let len = (width as usize)
            .checked_mul(height as usize)
            .ok_or(MetadataError::InvalidDimensions {
                width,
                height,
                len: 0,
            })?;
        Self::new(width, height, vec![u8::MAX; len])
    }

    /// Copy the alpha channel out of an RGBA image.
    pub fn from_rgba(image: &RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            values: image.pixels().map(|pixel| pixel[3]).collect(),
        }
    }

    /// Overwrite the alpha value at `(x, y)`; out-of-range writes are ignored.
    pub fn set(&mut self, x: u32, y: u32, value: u8) {
        if x < self.width && y < self.height {
            let idx = y as usize * self.width as usize + x as usize;
            self.values[idx] = value;
        }
    }

    /// Row-major alpha values.
    pub fn values(&self) -> &[u8] {
        &self.values
    }
}

impl AlphaChannel for AlphaPlane {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn get(&self, x: u32, y: u32) -> u8 {
        self.values[y as usize * self.width as usize + x as usize]
    }
}

impl AlphaChannel for RgbaImage {
    fn width(&self) -> u32 {
        self.dimensions().0
    }

    fn height(&self) -> u32 {
        self.dimensions().1
    }

    fn get(&self, x: u32, y: u32) -> u8 {
        self.get_pixel(x, y)[3]
    }
}

impl AlphaChannel for GrayAlphaImage {
    fn width(&self) -> u32 {
        self.dimensions().0
    }

    fn height(&self) -> u32 {
        self.dimensions().1
    }

    fn get(&self, x: u32, y: u32) -> u8 {
        self.get_pixel(x, y)[1]
    }
}

/// Contents of one named chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkValue {
    /// UTF-8 text chunk.
    Text(String),
    /// Raw bytes chunk (for example an EXIF `UserComment`).
    Bytes(Vec<u8>),
}

impl ChunkValue {
    /// Text content, if this is a text chunk.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Bytes(_) => None,
        }
    }
}

/// Named chunks attached to one decoded image, in file order.
#[derive(Clone, Default)]
pub struct RawChunkSet {
    chunks: IndexMap<ChunkName, ChunkValue>,
    alpha: Option<Arc<dyn AlphaChannel>>,
}

impl fmt::Debug for RawChunkSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChunkSet")
            .field("chunks", &self.chunks.keys().collect::<Vec<_>>())
            .field(
                "alpha",
                &self
                    .alpha
                    .as_ref()
                    .map(|alpha| (alpha.width(), alpha.height())),
            )
            .finish()
    }
}

impl RawChunkSet {
    /// Empty chunk set without an alpha channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style text chunk insertion.
    pub fn with_text(mut self, name: impl Into<ChunkName>, text: impl Into<String>) -> Self {
        self.insert_text(name, text);
        self
    }

    /// Builder-style bytes chunk insertion.
    pub fn with_bytes(mut self, name: impl Into<ChunkName>, bytes: impl Into<Vec<u8>>) -> Self {
        self.chunks
            .insert(name.into(), ChunkValue::Bytes(bytes.into()));
        self
    }

    /// Builder-style alpha channel attachment.
    pub fn with_alpha<A: AlphaChannel + 'static>(mut self, alpha: A) -> Self {
        self.alpha = Some(Arc::new(alpha));
        self
    }

    /// Insert or replace a text chunk, keeping its original position on replace.
    pub fn insert_text(&mut self, name: impl Into<ChunkName>, text: impl Into<String>) {
        self.chunks.insert(name.into(), ChunkValue::Text(text.into()));
    }

    /// Attach a shared alpha channel.
    pub fn set_alpha(&mut self, alpha: Arc<dyn AlphaChannel>) {
        self.alpha = Some(alpha);
    }

    /// Raw chunk lookup.
    pub fn get(&self, name: &str) -> Option<&ChunkValue> {
        self.chunks.get(name)
    }

    /// Text chunk lookup.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.chunks.get(name).and_then(ChunkValue::as_text)
    }

    /// All text chunks in file order.
    pub fn text_chunks(&self) -> impl Iterator<Item = (&str, &str)> {
        self.chunks
            .iter()
            .filter_map(|(name, value)| value.as_text().map(|text| (name.as_str(), text)))
    }

    /// Alpha channel accessor, when the image carries one.
    pub fn alpha(&self) -> Option<&dyn AlphaChannel> {
        self.alpha.as_deref()
    }

    /// Number of named chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `true` when no named chunks are present.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Decoded EXIF user comment, from either a bytes or a text chunk.
    pub fn user_comment(&self) -> Option<String> {
        match self.chunks.get(CHUNK_USER_COMMENT)? {
            ChunkValue::Text(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| text.clone())
            }
            ChunkValue::Bytes(bytes) => decode_user_comment(bytes),
        }
    }

    /// The free-text parameters block: `parameters` chunk, else the user comment.
    pub fn free_text_block(&self) -> Option<String> {
        if let Some(text) = self.text(CHUNK_PARAMETERS) {
            if !text.trim().is_empty() {
                return Some(text.to_string());
            }
        }
        self.user_comment()
    }
}

/// Decode an EXIF `UserComment` payload.
///
/// Strips the 8-byte character-code header, then keeps the most printable of
/// the UTF-8 / UTF-16LE / UTF-16BE decodings when it is mostly printable.
pub fn decode_user_comment(bytes: &[u8]) -> Option<String> {
    let payload = bytes
        .strip_prefix(USER_COMMENT_UNICODE_HEADER)
        .or_else(|| bytes.strip_prefix(USER_COMMENT_ASCII_HEADER))
        .unwrap_or(bytes);

    let decodings = [
        std::str::from_utf8(payload).ok().map(str::to_string),
        decode_utf16(payload, u16::from_le_bytes),
        decode_utf16(payload, u16::from_be_bytes),
    ];
    // Earlier decodings win ties.
    let mut best: Option<(f64, String)> = None;
    for decoded in decodings.into_iter().flatten() {
        let decoded = decoded.trim_end_matches('\0').to_string();
        if decoded.trim().is_empty() {
            continue;
        }
        let ratio = printable_ratio(&decoded);
        if best.as_ref().is_none_or(|(top, _)| ratio > *top) {
            best = Some((ratio, decoded));
        }
    }
    best.filter(|(ratio, _)| *ratio > USER_COMMENT_PRINTABLE_RATIO)
        .map(|(_, text)| text)
}

fn decode_utf16(payload: &[u8], read: fn([u8; 2]) -> u16) -> Option<String> {
    if payload.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| read([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

fn printable_ratio(text: &str) -> f64 {
    let mut total = 0usize;
    let mut printable = 0usize;
    for ch in text.chars() {
        total += 1;
        if !ch.is_control() || matches!(ch, '\n' | '\r' | '\t') {
            printable += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        printable as f64 / total as f64
    }
}
