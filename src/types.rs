/// Name of a side-channel chunk attached to an image.
/// Examples: `parameters`, `prompt`, `workflow`, `Comment`
pub type ChunkName = String;
/// Node identifier inside a generation graph.
/// Examples: `3`, `12`, `ksampler_main`
pub type NodeId = String;
/// Lower-cased key produced by the parameter tokenizer.
/// Examples: `steps`, `cfg scale`, `civitai resources`
pub type ParamKey = String;
/// Trimmed value produced by the parameter tokenizer.
/// Examples: `20`, `Euler a`, `[{"type":"lora","weight":0.8}]`
pub type ParamValue = String;
/// Display line describing one model resource.
/// Example: `[lora] detail tweaker (v1.0): 0.8`
pub type ResourceLine = String;
/// Identifier handed out for queued extraction requests.
pub type RequestId = u64;
