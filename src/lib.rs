#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Column-major alpha-channel bit reader.
pub mod bitstream;
/// Chunk sets, alpha-channel accessors and EXIF user comments.
pub mod chunks;
/// Extraction and service configuration.
pub mod config;
/// Centralized constants grouped by concern.
pub mod constants;
/// Canonical metadata record types.
pub mod data;
/// Ordered scheme detection.
pub mod detect;
/// Node-graph shapes and the graph tracer.
pub mod graph;
/// Scheme-to-record normalization and batch helpers.
pub mod normalize;
/// PNG chunk loading from disk.
pub mod png;
/// Background extraction service.
pub mod service;
/// Alpha-channel steganography decoding.
pub mod stealth;
/// Free-text parameter framing and tokenization.
pub mod tokenizer;
/// Shared type aliases.
pub mod types;

mod errors;

pub use chunks::{AlphaChannel, AlphaPlane, ChunkValue, RawChunkSet};
pub use config::{ExtractionConfig, ServiceConfig};
pub use data::{CanonicalMetadata, GenerationParams, ModelInfo, Prompts, Scheme};
pub use detect::{DetectedPayload, Detection, detect};
pub use errors::MetadataError;
pub use graph::{GraphShape, ParsedGraph, trace_graph};
pub use normalize::{
    detect_and_normalize, detect_and_normalize_with, normalize_batch, normalize_batch_with,
};
pub use png::{ChunkLoader, FileChunkLoader};
pub use service::{
    ExtractionCacheEntry, ExtractionCallback, ExtractionService, RequestStatus, ServiceStats,
};
pub use stealth::decode_stealth_payload;
pub use tokenizer::{FreeTextParts, ParameterTokens, split_free_text, tokenize_parameters};
pub use types::{ChunkName, NodeId, ParamKey, ParamValue, RequestId, ResourceLine};
