//! Alpha-channel LSB payload decoding.
//!
//! Wire layout, read column-major from the alpha LSBs:
//! `[15-byte "stealth_pngcomp"][u32 BE bit length][gzip JSON, bit length / 8 bytes]`.

use std::io::Read;

use flate2::read::GzDecoder;
use serde_json::Value;
use tracing::debug;

use crate::bitstream::BitstreamReader;
use crate::chunks::AlphaChannel;
pub use crate::constants::stealth::{MIN_FRAMING_PIXELS, STEALTH_MAGIC};

/// Recover a hidden JSON payload from `channel`.
///
/// Every failure (too few pixels, wrong magic, truncated stream, bad gzip,
/// bad UTF-8, bad JSON) yields `None`: probing is speculative.
pub fn decode_stealth_payload(channel: &dyn AlphaChannel) -> Option<Value> {
    let payload = read_framed_payload(channel)?;
    let text = match inflate(&payload) {
        Some(text) => text,
        None => {
            debug!(bytes = payload.len(), "stealth payload failed to decompress");
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(error = %err, "stealth payload is not valid JSON");
            None
        }
    }
}

/// Returns `true` when `channel` starts with the stealth magic literal.
pub fn has_stealth_magic(channel: &dyn AlphaChannel) -> bool {
    if channel.pixel_count() < MIN_FRAMING_PIXELS {
        return false;
    }
    let mut reader = BitstreamReader::new(channel);
    reader
        .read_exact(STEALTH_MAGIC.len())
        .is_some_and(|magic| magic.as_slice() == STEALTH_MAGIC.as_slice())
}

fn read_framed_payload(channel: &dyn AlphaChannel) -> Option<Vec<u8>> {
    if channel.pixel_count() < MIN_FRAMING_PIXELS {
        return None;
    }
    let mut reader = BitstreamReader::new(channel);
    let magic = reader.read_exact(STEALTH_MAGIC.len())?;
    if magic.as_slice() != STEALTH_MAGIC.as_slice() {
        return None;
    }
    let bit_len = reader.read_u32_be()?;
    let byte_len = (bit_len / 8) as usize;
    let payload = reader.read_exact(byte_len);
    if payload.is_none() {
        debug!(
            declared_bytes = byte_len,
            available_bits = reader.remaining_bits(),
            "stealth payload truncated"
        );
    }
    payload
}

fn inflate(compressed: &[u8]) -> Option<String> {
    let mut decoder = GzDecoder::new(compressed);
    let mut text = String::new();
    decoder.read_to_string(&mut text).ok()?;
    Some(text)
}
