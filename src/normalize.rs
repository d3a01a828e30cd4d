//! Mapping of every detected scheme into one `CanonicalMetadata` record.
//!
//! Normalization never fails: missing or unparseable values leave the
//! matching field empty and keep the raw text in `extra` where possible.

use std::str::FromStr;

use indexmap::IndexMap;
use rayon::prelude::*;
use serde_json::{Map, Value};
use tracing::debug;

use crate::chunks::RawChunkSet;
use crate::config::ExtractionConfig;
use crate::constants::normalize::{
    CHECKPOINT_RESOURCE_TYPE, DEFAULT_RESOURCE_WEIGHT, LORA_RESOURCE_TYPE, LORA_TAG_PREFIX,
    NOVELAI_CONSUMED_KEYS,
};
use crate::constants::tokenizer::{CIVITAI_RESOURCES_KEY, OVERRIDE_MARKERS};
use crate::data::{CanonicalMetadata, ModelInfo, Scheme};
use crate::detect::{DetectedPayload, Detection, detect};
use crate::graph::{ParsedGraph, trace_graph};
use crate::tokenizer::split_free_text;
use crate::types::{ParamKey, ParamValue};

/// Detect and normalize with the default configuration.
pub fn detect_and_normalize(chunks: &RawChunkSet) -> CanonicalMetadata {
    detect_and_normalize_with(chunks, &ExtractionConfig::default())
}

/// Detect and normalize with an explicit configuration.
pub fn detect_and_normalize_with(
    chunks: &RawChunkSet,
    config: &ExtractionConfig,
) -> CanonicalMetadata {
    let detection = detect(chunks, config);
    let free_text = chunks.free_text_block();
    normalize(&detection, free_text.as_deref(), config)
}

/// Normalize many chunk sets in parallel, preserving input order.
pub fn normalize_batch(batch: &[RawChunkSet]) -> Vec<CanonicalMetadata> {
    normalize_batch_with(batch, &ExtractionConfig::default())
}

/// [`normalize_batch`] with an explicit configuration.
pub fn normalize_batch_with(
    batch: &[RawChunkSet],
    config: &ExtractionConfig,
) -> Vec<CanonicalMetadata> {
    batch
        .par_iter()
        .map(|chunks| detect_and_normalize_with(chunks, config))
        .collect()
}

/// Build the canonical record for `detection`.
///
/// `free_text` is the image's free-text block (the `parameters` chunk or the
/// decoded user comment). When it carries `Steps:` or `Sampler:` it replaces
/// any structured result; otherwise it is only kept as `raw_text`.
pub fn normalize(
    detection: &Detection,
    free_text: Option<&str>,
    config: &ExtractionConfig,
) -> CanonicalMetadata {
    if config.free_text_override {
        if let Some(text) = free_text.filter(|text| has_override_marker(text)) {
            if detection.scheme != Scheme::FreeText {
                debug!(
                    detected = detection.scheme.as_str(),
                    "free-text parameters override structured metadata"
                );
            }
            return normalize_free_text(text, config);
        }
    }

    let mut record = match &detection.payload {
        DetectedPayload::Graph(graph) => normalize_graph(graph, config),
        DetectedPayload::NovelAiComment(map) => normalize_novelai(map.clone(), Scheme::GenericJson),
        DetectedPayload::Stealth(value) => normalize_json(value, Scheme::Steganographic),
        DetectedPayload::Json(value) => normalize_json(value, Scheme::GenericJson),
        DetectedPayload::FreeText(text) => return normalize_free_text(text, config),
        DetectedPayload::Nothing => CanonicalMetadata::unknown(),
    };
    record.raw_text = free_text
        .filter(|text| !text.trim().is_empty())
        .map(str::to_string);
    record
}

/// Returns `true` when `text` carries a case-sensitive `Steps:` or `Sampler:` marker.
pub fn has_override_marker(text: &str) -> bool {
    OVERRIDE_MARKERS.iter().any(|marker| text.contains(marker))
}

fn normalize_graph(graph: &ParsedGraph, config: &ExtractionConfig) -> CanonicalMetadata {
    let traced = trace_graph(graph, config);
    if traced.used_prompt_fallback {
        debug!(nodes = graph.len(), "graph prompts gathered from every encoder");
    }
    let mut record = CanonicalMetadata {
        scheme: Scheme::GraphBased,
        ..CanonicalMetadata::default()
    };
    record.generation.seed = traced.seed;
    record.generation.steps = traced.steps;
    record.generation.cfg = traced.cfg;
    record.generation.sampler = traced.sampler;
    record.generation.scheduler = traced.scheduler;
    record.prompts.positive = traced.positive.unwrap_or_default();
    record.prompts.negative = traced.negative.unwrap_or_default();
    record.model.checkpoint = traced.checkpoint;
    record.model.loras = traced.loras;
    record
}

fn normalize_json(value: &Value, scheme: Scheme) -> CanonicalMetadata {
    match value {
        Value::Object(map) => normalize_novelai(map.clone(), scheme),
        other => {
            let mut record = CanonicalMetadata {
                scheme,
                ..CanonicalMetadata::default()
            };
            record
                .extra
                .insert("payload".to_string(), other.to_string());
            record
        }
    }
}

/// Map a NovelAI-style JSON object into the canonical record.
fn normalize_novelai(mut map: Map<String, Value>, scheme: Scheme) -> CanonicalMetadata {
    let nested = map
        .get("Comment")
        .and_then(Value::as_str)
        .and_then(|comment| serde_json::from_str::<Value>(comment).ok());
    if let Some(Value::Object(inner)) = nested {
        for (key, value) in inner {
            map.insert(key, value);
        }
    }

    let mut record = CanonicalMetadata {
        scheme,
        ..CanonicalMetadata::default()
    };
    let mut unparsed: Vec<(ParamKey, ParamValue)> = Vec::new();
    let numeric = |key: &str| -> Option<String> {
        let rendered = map.get(key).map(render_json)?;
        Some(rendered).filter(|text| !text.is_empty())
    };

    record.generation.steps = parse_or_keep(numeric("steps"), "steps", &mut unparsed);
    record.generation.cfg = parse_or_keep(numeric("scale"), "scale", &mut unparsed);
    record.generation.seed = parse_or_keep(numeric("seed"), "seed", &mut unparsed);
    record.generation.sampler = map
        .get("sampler")
        .map(render_json)
        .filter(|text| !text.is_empty());
    record.generation.scheduler = map
        .get("noise_schedule")
        .map(render_json)
        .filter(|text| !text.is_empty());
    record.prompts.positive = map.get("prompt").map(render_json).unwrap_or_default();
    record.prompts.negative = map.get("uc").map(render_json).unwrap_or_default();

    for (key, value) in &map {
        if !NOVELAI_CONSUMED_KEYS.contains(&key.as_str()) {
            record.extra.insert(key.clone(), render_json(value));
        }
    }
    record.extra.extend(unparsed);
    record
}

fn parse_or_keep<T: FromStr>(
    raw: Option<String>,
    key: &str,
    unparsed: &mut Vec<(ParamKey, ParamValue)>,
) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            unparsed.push((key.to_string(), raw));
            None
        }
    }
}

/// Strings verbatim, everything else as compact JSON.
fn render_json(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Normalize a free-text parameter block.
pub fn normalize_free_text(text: &str, config: &ExtractionConfig) -> CanonicalMetadata {
    let parts = split_free_text(text);
    let mut fields = parts.parameters.fields;
    let mut record = CanonicalMetadata {
        scheme: Scheme::FreeText,
        raw_text: Some(text.to_string()),
        ..CanonicalMetadata::default()
    };

    record.generation.steps = take_parsed(&mut fields, "steps");
    record.generation.sampler = take_text(&mut fields, "sampler");
    record.generation.cfg = take_parsed(&mut fields, "cfg scale");
    record.generation.seed = take_parsed(&mut fields, "seed");
    record.generation.scheduler =
        take_text(&mut fields, "schedule type").or_else(|| take_text(&mut fields, "scheduler"));

    record.model.checkpoint =
        take_text(&mut fields, "model").or_else(|| take_text(&mut fields, "model hash"));
    if let Some(checkpoint) = &record.model.checkpoint {
        record
            .model
            .resources
            .push(format!("[{CHECKPOINT_RESOURCE_TYPE}] {checkpoint}"));
    }
    if let Some(raw) = fields.shift_remove(CIVITAI_RESOURCES_KEY) {
        expand_civitai_resources(&raw, &mut record.model);
    }
    if let Some(resources) = fields.shift_remove("resources") {
        record.model.resources.push(resources);
    }
    if config.collect_prompt_lora_tags {
        record.model.loras.extend(prompt_lora_tags(&parts.positive));
    }

    record.prompts.positive = parts.positive;
    record.prompts.negative = parts.negative;
    record.extra = fields;
    record
}

/// Remove and parse `key`; unparseable values stay behind for `extra`.
fn take_parsed<T: FromStr>(fields: &mut IndexMap<ParamKey, ParamValue>, key: &str) -> Option<T> {
    let parsed = fields.get(key)?.trim().parse().ok()?;
    fields.shift_remove(key);
    Some(parsed)
}

fn take_text(fields: &mut IndexMap<ParamKey, ParamValue>, key: &str) -> Option<String> {
    if fields.get(key).is_some_and(|value| value.is_empty()) {
        return None;
    }
    fields.shift_remove(key)
}

/// Expand a `Civitai resources` JSON array into display lines and LoRAs.
///
/// Anything that is not a JSON array is kept as one verbatim line.
pub fn expand_civitai_resources(raw: &str, model: &mut ModelInfo) {
    let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(raw) else {
        model.resources.push(raw.to_string());
        return;
    };
    for entry in entries.iter().filter_map(Value::as_object) {
        let kind = entry
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let name = entry
            .get("modelName")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let version = entry
            .get("modelVersionName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let weight = entry
            .get("weight")
            .filter(|weight| !weight.is_null())
            .map(render_json)
            .unwrap_or_else(|| DEFAULT_RESOURCE_WEIGHT.to_string());

        let mut line = format!("[{kind}] {name}");
        if !version.is_empty() {
            line.push_str(&format!(" ({version})"));
        }
        if !kind.eq_ignore_ascii_case(CHECKPOINT_RESOURCE_TYPE) {
            line.push_str(&format!(": {weight}"));
        }
        model.resources.push(line);

        if kind.eq_ignore_ascii_case(LORA_RESOURCE_TYPE) {
            model.loras.push(format!("{name} ({weight})"));
        }
    }
}

/// `<lora:name:weight>` tags in `prompt`, as `"name (weight)"`.
pub fn prompt_lora_tags(prompt: &str) -> Vec<String> {
    let mut loras = Vec::new();
    let mut rest = prompt;
    while let Some(start) = rest.find(LORA_TAG_PREFIX) {
        let body = &rest[start + LORA_TAG_PREFIX.len()..];
        let Some(end) = body.find('>') else {
            break;
        };
        let mut parts = body[..end].split(':');
        let name = parts.next().map(str::trim).unwrap_or_default();
        let weight = parts
            .next()
            .map(str::trim)
            .filter(|weight| !weight.is_empty())
            .unwrap_or(DEFAULT_RESOURCE_WEIGHT);
        if !name.is_empty() {
            loras.push(format!("{name} ({weight})"));
        }
        rest = &body[end + 1..];
    }
    loras
}
