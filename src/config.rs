use crate::constants::chunks::METADATA_COMMENT_CHUNKS;
use crate::constants::graph::FALLBACK_PROMPT_SEPARATOR;
use crate::constants::service::WORKER_THREAD_NAME;

/// Tunables for the detection and normalization pipeline.
#[derive(Clone, Debug)]
pub struct ExtractionConfig {
    /// Let a free-text block carrying `Steps:`/`Sampler:` override structured results.
    ///
    /// Structured sources are written once at generation time while the
    /// free-text block may have been edited afterwards.
    pub free_text_override: bool,
    /// Separator used when the graph tracer falls back to gathering every encoder text.
    pub fallback_prompt_separator: String,
    /// Chunk names checked for NovelAI JSON comment objects, in order.
    pub comment_chunk_names: Vec<String>,
    /// Scan `<lora:name:weight>` tags in free-text prompts into the LoRA list.
    pub collect_prompt_lora_tags: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            free_text_override: true,
            fallback_prompt_separator: FALLBACK_PROMPT_SEPARATOR.to_string(),
            comment_chunk_names: METADATA_COMMENT_CHUNKS
                .iter()
                .map(|name| name.to_string())
                .collect(),
            collect_prompt_lora_tags: true,
        }
    }
}

/// Top-level extraction service configuration.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Name given to the background worker thread.
    pub worker_thread_name: String,
    /// Pipeline configuration applied to every extraction.
    pub extraction: ExtractionConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_thread_name: WORKER_THREAD_NAME.to_string(),
            extraction: ExtractionConfig::default(),
        }
    }
}
