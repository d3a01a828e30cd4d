//! Ordered scheme detection over a chunk set.
//!
//! Each rule is a pure predicate over the chunks; the first rule that matches
//! decides the scheme. Richer structured sources come first because schemes
//! are not mutually exclusive within one chunk set.

use serde_json::{Map, Value};
use tracing::debug;

use crate::chunks::RawChunkSet;
use crate::config::ExtractionConfig;
use crate::constants::chunks::{
    CHUNK_EDITABLE_GRAPH, CHUNK_EXECUTION_GRAPH, CHUNK_PARAMETERS, CHUNK_USER_COMMENT,
    NOVELAI_MARKER_KEYS,
};
use crate::constants::stealth::MIN_FRAMING_PIXELS;
use crate::constants::tokenizer::{SAMPLER_MARKER, STEPS_MARKER};
use crate::data::Scheme;
use crate::graph::{GraphShape, ParsedGraph};
use crate::stealth::decode_stealth_payload;
use crate::tokenizer::contains_marker;
use crate::types::ChunkName;

/// Raw payload handed from detection to normalization.
#[derive(Clone, Debug, PartialEq)]
pub enum DetectedPayload {
    /// Normalized node graph.
    Graph(ParsedGraph),
    /// NovelAI JSON object from a metadata-comment chunk.
    NovelAiComment(Map<String, Value>),
    /// Decoded alpha-channel payload.
    Stealth(Value),
    /// JSON text chunk matched by the free-text heuristic.
    Json(Value),
    /// Free-text parameter block.
    FreeText(String),
    /// Nothing matched.
    Nothing,
}

/// Outcome of detection: exactly one scheme and its payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// Scheme chosen by the first matching rule.
    pub scheme: Scheme,
    /// Payload for that scheme only.
    pub payload: DetectedPayload,
    /// Chunk the payload came from; `None` for the alpha channel or no match.
    pub source_chunk: Option<ChunkName>,
}

impl Detection {
    /// Detection miss.
    pub fn unknown() -> Self {
        Self {
            scheme: Scheme::Unknown,
            payload: DetectedPayload::Nothing,
            source_chunk: None,
        }
    }

    fn from_chunk(scheme: Scheme, payload: DetectedPayload, chunk: &str) -> Self {
        Self {
            scheme,
            payload,
            source_chunk: Some(chunk.to_string()),
        }
    }
}

/// Signature shared by every detection rule.
pub type DetectionRule = fn(&RawChunkSet, &ExtractionConfig) -> Option<Detection>;

/// Detection rules in priority order, with names used in logs.
pub const DETECTION_RULES: [(&str, DetectionRule); 4] = [
    ("node_graph", detect_node_graph),
    ("novelai_comment", detect_novelai_comment),
    ("stealth_alpha", detect_stealth_alpha),
    ("free_text", detect_free_text),
];

/// Run the rule table and return the first match, or `Unknown`.
pub fn detect(chunks: &RawChunkSet, config: &ExtractionConfig) -> Detection {
    for (rule, predicate) in DETECTION_RULES {
        if let Some(detection) = predicate(chunks, config) {
            debug!(
                rule,
                scheme = detection.scheme.as_str(),
                chunk = detection.source_chunk.as_deref().unwrap_or("-"),
                "metadata scheme detected"
            );
            return detection;
        }
    }
    debug!(chunks = chunks.len(), "no metadata scheme matched");
    Detection::unknown()
}

/// Rule 1: a graph chunk (execution graph preferred) or user comment with node-graph shape.
pub fn detect_node_graph(chunks: &RawChunkSet, _config: &ExtractionConfig) -> Option<Detection> {
    for name in [CHUNK_EXECUTION_GRAPH, CHUNK_EDITABLE_GRAPH] {
        let Some(text) = chunks.text(name) else {
            continue;
        };
        match GraphShape::from_json_str(text) {
            Some(shape) => {
                return Some(Detection::from_chunk(
                    Scheme::GraphBased,
                    DetectedPayload::Graph(shape.into_graph()),
                    name,
                ));
            }
            None => debug!(chunk = name, "graph chunk has no node-graph shape"),
        }
    }
    let comment = chunks.user_comment()?;
    let shape = GraphShape::from_json_str(comment.trim())?;
    Some(Detection::from_chunk(
        Scheme::GraphBased,
        DetectedPayload::Graph(shape.into_graph()),
        CHUNK_USER_COMMENT,
    ))
}

/// Rule 2: a metadata-comment chunk holding a NovelAI JSON object.
pub fn detect_novelai_comment(
    chunks: &RawChunkSet,
    config: &ExtractionConfig,
) -> Option<Detection> {
    config.comment_chunk_names.iter().find_map(|name| {
        let text = chunks.text(name)?.trim();
        if !text.starts_with('{') {
            return None;
        }
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) else {
            return None;
        };
        if !NOVELAI_MARKER_KEYS.iter().any(|key| map.contains_key(*key)) {
            return None;
        }
        Some(Detection::from_chunk(
            Scheme::GenericJson,
            DetectedPayload::NovelAiComment(map),
            name,
        ))
    })
}

/// Rule 3: a stealth payload in the alpha channel.
pub fn detect_stealth_alpha(chunks: &RawChunkSet, _config: &ExtractionConfig) -> Option<Detection> {
    let alpha = chunks.alpha()?;
    if alpha.pixel_count() < MIN_FRAMING_PIXELS {
        return None;
    }
    let payload = decode_stealth_payload(alpha)?;
    Some(Detection {
        scheme: Scheme::Steganographic,
        payload: DetectedPayload::Stealth(payload),
        source_chunk: None,
    })
}

/// Rule 4: a text chunk that looks like JSON or like a parameter block.
///
/// Probes `parameters`, then the decoded user comment, then every other text
/// chunk in file order.
pub fn detect_free_text(chunks: &RawChunkSet, _config: &ExtractionConfig) -> Option<Detection> {
    let mut candidates: Vec<(String, String)> = Vec::new();
    if let Some(text) = chunks.text(CHUNK_PARAMETERS) {
        candidates.push((CHUNK_PARAMETERS.to_string(), text.to_string()));
    }
    if let Some(text) = chunks.user_comment() {
        candidates.push((CHUNK_USER_COMMENT.to_string(), text));
    }
    for (name, text) in chunks.text_chunks() {
        if name != CHUNK_PARAMETERS && name != CHUNK_USER_COMMENT {
            candidates.push((name.to_string(), text.to_string()));
        }
    }

    candidates.into_iter().find_map(|(name, text)| {
        if !looks_like_free_text(&text) {
            return None;
        }
        let detection = match serde_json::from_str::<Value>(text.trim()) {
            Ok(value) => Detection::from_chunk(Scheme::GenericJson, DetectedPayload::Json(value), &name),
            Err(_) => Detection::from_chunk(Scheme::FreeText, DetectedPayload::FreeText(text), &name),
        };
        Some(detection)
    })
}

/// Free-text heuristic: braces around the content, or both `steps:` and `sampler:`.
pub fn looks_like_free_text(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return true;
    }
    contains_marker(trimmed, STEPS_MARKER) && contains_marker(trimmed, SAMPLER_MARKER)
}
