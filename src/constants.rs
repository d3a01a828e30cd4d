/// Chunk names consumed from image side channels.
pub mod chunks {
    /// Execution (API-shaped) graph chunk; preferred when both graph chunks parse.
    pub const CHUNK_EXECUTION_GRAPH: &str = "prompt";
    /// Editable (UI-shaped) graph chunk.
    pub const CHUNK_EDITABLE_GRAPH: &str = "workflow";
    /// Free-text generation parameters chunk.
    pub const CHUNK_PARAMETERS: &str = "parameters";
    /// Raw-bytes chunk carrying the EXIF `UserComment` payload.
    pub const CHUNK_USER_COMMENT: &str = "UserComment";
    /// Alternate metadata-comment chunks checked for structured JSON.
    pub const METADATA_COMMENT_CHUNKS: [&str; 3] = ["Comment", "Description", "Software"];
    /// Keys whose presence marks a comment object as a NovelAI record.
    pub const NOVELAI_MARKER_KEYS: [&str; 3] = ["n_samples", "uc", "steps"];
    /// EXIF `UserComment` character-code header for UTF-16 text.
    pub const USER_COMMENT_UNICODE_HEADER: &[u8] = b"UNICODE\0";
    /// EXIF `UserComment` character-code header for ASCII text.
    pub const USER_COMMENT_ASCII_HEADER: &[u8] = b"ASCII\0\0\0";
    /// Minimum share of printable characters for a decoded user comment.
    pub const USER_COMMENT_PRINTABLE_RATIO: f64 = 0.8;
}

/// Constants describing the alpha-channel steganography framing.
pub mod stealth {
    /// ASCII magic literal that opens every payload.
    pub const STEALTH_MAGIC: &[u8; 15] = b"stealth_pngcomp";
    /// Byte width of the big-endian bit-length header.
    pub const LENGTH_HEADER_BYTES: usize = 4;
    /// Pixels needed to hold the magic literal plus the length header.
    pub const MIN_FRAMING_PIXELS: u64 = ((STEALTH_MAGIC.len() + LENGTH_HEADER_BYTES) * 8) as u64;
}

/// Node kinds and input names recognized by the graph tracer.
pub mod graph {
    /// Sampler node kinds, in no particular priority.
    pub const SAMPLER_KINDS: [&str; 3] = ["KSampler", "KSamplerAdvanced", "KSampler (Efficient)"];
    /// Node kinds whose `text` input resolves a linked prompt.
    pub const PROMPT_SOURCE_KINDS: [&str; 4] =
        ["CLIPTextEncode", "CLIPTextEncodeSDXL", "ShowText", "Text"];
    /// Node kinds gathered by the imprecise all-encoders prompt fallback.
    pub const TEXT_ENCODER_KINDS: [&str; 2] = ["CLIPTextEncode", "CLIPTextEncodeSDXL"];
    /// Checkpoint loader node kinds.
    pub const CHECKPOINT_KINDS: [&str; 2] = ["CheckpointLoaderSimple", "CheckpointLoader"];
    /// LoRA loader node kinds.
    pub const LORA_KINDS: [&str; 1] = ["LoraLoader"];
    /// Top-level array field holding UI-shaped nodes.
    pub const UI_NODES_FIELD: &str = "nodes";
    /// Top-level array field holding UI-shaped link tuples.
    pub const UI_LINKS_FIELD: &str = "links";
    /// Separator used when joining fallback prompt texts.
    pub const FALLBACK_PROMPT_SEPARATOR: &str = "\n---\n";

    /// Positional widget names for UI-shaped nodes, per node kind.
    pub const WIDGET_LAYOUTS: &[(&str, &[&str])] = &[
        (
            "KSampler",
            &[
                "seed",
                "control_after_generate",
                "steps",
                "cfg",
                "sampler_name",
                "scheduler",
                "denoise",
            ],
        ),
        (
            "KSamplerAdvanced",
            &[
                "add_noise",
                "noise_seed",
                "control_after_generate",
                "steps",
                "cfg",
                "sampler_name",
                "scheduler",
                "start_at_step",
                "end_at_step",
                "return_with_leftover_noise",
            ],
        ),
        ("CLIPTextEncode", &["text"]),
        ("CheckpointLoaderSimple", &["ckpt_name"]),
        ("CheckpointLoader", &["config_name", "ckpt_name"]),
        ("LoraLoader", &["lora_name", "strength_model", "strength_clip"]),
    ];
}

/// Markers and keys used by the free-text parameter framing.
pub mod tokenizer {
    /// Marker separating the positive prompt from the negative prompt.
    pub const NEGATIVE_PROMPT_MARKER: &str = "negative prompt:";
    /// Marker opening the parameter section.
    pub const STEPS_MARKER: &str = "steps:";
    /// Second marker used by the free-text heuristic.
    pub const SAMPLER_MARKER: &str = "sampler:";
    /// Key preserved raw for round-trip fidelity.
    pub const CIVITAI_RESOURCES_KEY: &str = "civitai resources";
    /// Case-sensitive markers that let a free-text block override structured data.
    pub const OVERRIDE_MARKERS: [&str; 2] = ["Steps:", "Sampler:"];
}

/// Constants used by the normalizer.
pub mod normalize {
    /// Resource type whose display line carries no weight suffix.
    pub const CHECKPOINT_RESOURCE_TYPE: &str = "checkpoint";
    /// Resource type that also contributes to the LoRA list.
    pub const LORA_RESOURCE_TYPE: &str = "lora";
    /// Weight shown when a resource entry omits one.
    pub const DEFAULT_RESOURCE_WEIGHT: &str = "1.0";
    /// Opening of an inline LoRA prompt tag (`<lora:name:weight>`).
    pub const LORA_TAG_PREFIX: &str = "<lora:";
    /// Keys of NovelAI records that never flow into `extra`.
    pub const NOVELAI_CONSUMED_KEYS: [&str; 11] = [
        "prompt",
        "uc",
        "steps",
        "sampler",
        "scale",
        "seed",
        "noise_schedule",
        "Comment",
        "Description",
        "Source",
        "Software",
    ];
}

/// Constants used by the extraction service worker.
pub mod service {
    /// Default name of the background worker thread.
    pub const WORKER_THREAD_NAME: &str = "genmeta-extract";
}
