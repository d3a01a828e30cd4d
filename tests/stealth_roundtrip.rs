use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use image::{Rgba, RgbaImage};
use serde_json::json;

use genmeta::stealth::{STEALTH_MAGIC, has_stealth_magic};
use genmeta::{
    AlphaChannel, AlphaPlane, RawChunkSet, Scheme, decode_stealth_payload, detect_and_normalize,
};

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

fn push_bits(bits: &mut Vec<u8>, bytes: &[u8]) {
    for byte in bytes {
        for shift in (0..8).rev() {
            bits.push((*byte >> shift) & 1);
        }
    }
}

/// Frame `payload` (already compressed) and return the bit sequence.
fn framed_bits(payload: &[u8]) -> Vec<u8> {
    let mut bits = Vec::new();
    push_bits(&mut bits, STEALTH_MAGIC);
    push_bits(&mut bits, &((payload.len() * 8) as u32).to_be_bytes());
    push_bits(&mut bits, payload);
    bits
}

/// Write `bits` column-major into the alpha LSBs of an opaque plane.
fn embed(bits: &[u8], width: u32, height: u32) -> AlphaPlane {
    let mut plane = AlphaPlane::opaque(width, height).unwrap();
    for (idx, bit) in bits.iter().enumerate() {
        let idx = idx as u32;
        plane.set(idx / height, idx % height, 0xfe | bit);
    }
    plane
}

#[test]
fn steps_and_seed_survive_the_alpha_channel() {
    let payload = gzip(br#"{"steps": 20, "seed": 123}"#);
    let plane = embed(&framed_bits(&payload), 48, 48);

    assert!(has_stealth_magic(&plane));
    assert_eq!(
        decode_stealth_payload(&plane),
        Some(json!({"steps": 20, "seed": 123}))
    );

    let record = detect_and_normalize(&RawChunkSet::new().with_alpha(plane));
    assert_eq!(record.scheme, Scheme::Steganographic);
    assert_eq!(record.generation.steps, Some(20));
    assert_eq!(record.generation.seed, Some(123));
    assert!(record.extra.is_empty());
}

#[test]
fn novelai_stealth_comment_is_merged() {
    let comment = json!({"prompt": "a fox", "uc": "lowres", "steps": 28, "scale": 5.0, "sampler": "k_euler_ancestral", "n_samples": 1}).to_string();
    let outer = json!({"Software": "NovelAI", "Comment": comment}).to_string();
    let plane = embed(&framed_bits(&gzip(outer.as_bytes())), 64, 64);

    let record = detect_and_normalize(&RawChunkSet::new().with_alpha(plane));
    assert_eq!(record.scheme, Scheme::Steganographic);
    assert_eq!(record.prompts.positive, "a fox");
    assert_eq!(record.prompts.negative, "lowres");
    assert_eq!(record.generation.cfg, Some(5.0));
    assert_eq!(record.generation.sampler.as_deref(), Some("k_euler_ancestral"));
    let extra: Vec<&str> = record.extra.keys().map(String::as_str).collect();
    assert_eq!(extra, vec!["n_samples"]);
}

#[test]
fn rgba_image_adapter_reads_the_same_bits() {
    let bits = framed_bits(&gzip(br#"{"steps": 20, "seed": 123}"#));
    let height = 40;
    let mut image = RgbaImage::from_pixel(40, height, Rgba([10, 20, 30, 255]));
    for (idx, bit) in bits.iter().enumerate() {
        let idx = idx as u32;
        image.put_pixel(idx / height, idx % height, Rgba([10, 20, 30, 0xfe | bit]));
    }
    assert_eq!(image.pixel_count(), 1600);
    assert_eq!(
        decode_stealth_payload(&image),
        Some(json!({"steps": 20, "seed": 123}))
    );
}

#[test]
fn row_major_embedding_is_not_recognized() {
    let bits = framed_bits(&gzip(br#"{"steps": 20}"#));
    let (width, height) = (48u32, 48u32);
    let mut plane = AlphaPlane::opaque(width, height).unwrap();
    for (idx, bit) in bits.iter().enumerate() {
        let idx = idx as u32;
        plane.set(idx % width, idx / width, 0xfe | bit);
    }
    assert!(!has_stealth_magic(&plane));
    assert_eq!(decode_stealth_payload(&plane), None);
}

#[test]
fn truncated_and_corrupt_payloads_fail_cleanly() {
    let payload = gzip(br#"{"steps": 20, "seed": 123}"#);
    let mut bits = framed_bits(&payload);
    bits.truncate(bits.len() - 16);
    let truncated = embed(&bits, 24, 24);
    assert_eq!(decode_stealth_payload(&truncated), None);

    // Header claims far more payload than the plane can carry.
    let oversized = framed_bits(&vec![0u8; 4096]);
    let header_only = &oversized[..(STEALTH_MAGIC.len() + 4) * 8];
    assert_eq!(decode_stealth_payload(&embed(header_only, 32, 32)), None);

    let not_gzip = framed_bits(b"plain bytes, not gzip");
    assert_eq!(decode_stealth_payload(&embed(&not_gzip, 32, 32)), None);

    let not_json = framed_bits(&gzip(b"not json"));
    assert_eq!(decode_stealth_payload(&embed(&not_json, 32, 32)), None);
}

#[test]
fn below_framing_minimum_is_unknown() {
    let plane = AlphaPlane::opaque(1, 151).unwrap();
    assert!(!has_stealth_magic(&plane));
    let record = detect_and_normalize(&RawChunkSet::new().with_alpha(plane));
    assert_eq!(record.scheme, Scheme::Unknown);
}
