use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use crate::types::{ParamKey, ParamValue, ResourceLine};

/// Which producer format an image's chunks matched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// Node-graph JSON (execution or editor layout).
    GraphBased,
    /// Gzip JSON hidden in the alpha channel LSBs.
    Steganographic,
    /// Free-text `Key: Value` parameter block.
    FreeText,
    /// JSON object stored in a text chunk.
    GenericJson,
    /// Nothing recognizable.
    #[default]
    Unknown,
}

impl Scheme {
    /// Stable lower-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GraphBased => "graph_based",
            Self::Steganographic => "steganographic",
            Self::FreeText => "free_text",
            Self::GenericJson => "generic_json",
            Self::Unknown => "unknown",
        }
    }
}

/// Sampler settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Sampling step count.
    pub steps: Option<u32>,
    /// Sampler name as written by the producer (`Euler a`, `dpmpp_2m`, ...).
    pub sampler: Option<String>,
    /// Classifier-free guidance scale.
    pub cfg: Option<f64>,
    /// Noise seed.
    pub seed: Option<i64>,
    /// Noise schedule (`karras`, `Schedule type`, NovelAI `noise_schedule`).
    pub scheduler: Option<String>,
}

/// Model resources used for the generation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Base checkpoint name or file.
    pub checkpoint: Option<String>,
    /// `"<name> (<strength>)"` entries in source order.
    pub loras: Vec<String>,
    /// Display lines such as `[lora] name (version): 0.8`.
    pub resources: Vec<ResourceLine>,
}

/// Prompt texts; empty when unresolved.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Prompts {
    /// Positive prompt.
    pub positive: String,
    /// Negative prompt.
    pub negative: String,
}

/// One normalized metadata record per image, whatever wrote it.
///
/// Every section is always present. `extra` keeps unmapped fields in source
/// order and never repeats a key that was mapped into another section.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMetadata {
    /// Producer format the record was built from.
    pub scheme: Scheme,
    /// Sampler settings.
    pub generation: GenerationParams,
    /// Checkpoint, LoRAs and resource lines.
    pub model: ModelInfo,
    /// Positive and negative prompts.
    pub prompts: Prompts,
    /// Unmapped fields rendered as text, in source order.
    pub extra: IndexMap<ParamKey, ParamValue>,
    /// Verbatim free-text block, kept so edits can be re-serialized losslessly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
}

impl CanonicalMetadata {
    /// Record for an image with no recognizable metadata.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Returns `true` when no scheme matched.
    pub fn is_unknown(&self) -> bool {
        self.scheme == Scheme::Unknown
    }

    /// Serialize back into the free-text parameter form.
    ///
    /// The verbatim `raw_text` wins when present; otherwise the text is built
    /// from the structured fields.
    pub fn to_parameters_text(&self) -> String {
        if let Some(raw) = &self.raw_text {
            return raw.clone();
        }

        let mut text = self.prompts.positive.clone();
        if !self.prompts.negative.is_empty() {
            text.push_str("\nNegative prompt: ");
            text.push_str(&self.prompts.negative);
        }

        let generation = &self.generation;
        let mut parts: Vec<String> = Vec::new();
        if let Some(steps) = generation.steps {
            parts.push(format!("Steps: {steps}"));
        }
        if let Some(sampler) = &generation.sampler {
            parts.push(format!("Sampler: {sampler}"));
        }
        if let Some(cfg) = generation.cfg {
            parts.push(format!("CFG scale: {cfg}"));
        }
        if let Some(seed) = generation.seed {
            parts.push(format!("Seed: {seed}"));
        }
        if let Some(scheduler) = &generation.scheduler {
            parts.push(format!("Schedule type: {scheduler}"));
        }
        if let Some(checkpoint) = &self.model.checkpoint {
            parts.push(format!("Model: {checkpoint}"));
        }
        for (key, value) in &self.extra {
            parts.push(format!("{key}: {value}"));
        }
        if !parts.is_empty() {
            text.push('\n');
            text.push_str(&parts.join(", "));
        }

        let resources: Vec<&str> = self
            .model
            .resources
            .iter()
            .map(String::as_str)
            .filter(|line| !line.to_ascii_lowercase().starts_with("[checkpoint]"))
            .collect();
        if !resources.is_empty() {
            text.push_str("\nResources:\n");
            text.push_str(&resources.join("\n"));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_record_is_unknown_and_empty() {
        let record = CanonicalMetadata::unknown();
        assert!(record.is_unknown());
        assert_eq!(record.generation, GenerationParams::default());
        assert!(record.model.loras.is_empty());
        assert_eq!(record.prompts.positive, "");
        assert_eq!(record.to_parameters_text(), "");
    }

    #[test]
    fn raw_text_is_returned_verbatim() {
        let record = CanonicalMetadata {
            raw_text: Some("a cat\nSteps: 20".to_string()),
            prompts: Prompts {
                positive: "ignored".to_string(),
                negative: String::new(),
            },
            ..CanonicalMetadata::default()
        };
        assert_eq!(record.to_parameters_text(), "a cat\nSteps: 20");
    }

    #[test]
    fn structured_fields_are_serialized_in_parameter_order() {
        let mut record = CanonicalMetadata {
            scheme: Scheme::GraphBased,
            generation: GenerationParams {
                steps: Some(20),
                sampler: Some("euler".to_string()),
                cfg: Some(7.5),
                seed: Some(5),
                scheduler: None,
            },
            prompts: Prompts {
                positive: "a cat".to_string(),
                negative: "blurry".to_string(),
            },
            ..CanonicalMetadata::default()
        };
        record.model.checkpoint = Some("sdxl".to_string());
        record.model.resources = vec![
            "[checkpoint] sdxl".to_string(),
            "[lora] detail (v1): 0.8".to_string(),
        ];
        record.extra.insert("size".to_string(), "512x768".to_string());

        assert_eq!(
            record.to_parameters_text(),
            "a cat\nNegative prompt: blurry\nSteps: 20, Sampler: euler, CFG scale: 7.5, Seed: 5, Model: sdxl, size: 512x768\nResources:\n[lora] detail (v1): 0.8"
        );
    }

    #[test]
    fn scheme_serializes_snake_case() {
        let json = serde_json::to_string(&Scheme::GenericJson).unwrap();
        assert_eq!(json, "\"generic_json\"");
        assert_eq!(Scheme::FreeText.as_str(), "free_text");
    }
}
