//! Node-graph payloads and the tracer that pulls generation settings out of them.
//!
//! Ownership model:
//! - `GraphShape` resolves the UI-vs-API payload ambiguity once, at the boundary.
//! - `ParsedGraph` is the single adjacency representation the tracer walks.
//! - `trace_graph` reads settings, prompts, checkpoint and LoRAs from it.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::config::ExtractionConfig;
use crate::constants::graph::{
    CHECKPOINT_KINDS, LORA_KINDS, PROMPT_SOURCE_KINDS, SAMPLER_KINDS, TEXT_ENCODER_KINDS,
    UI_LINKS_FIELD, UI_NODES_FIELD, WIDGET_LAYOUTS,
};
use crate::types::NodeId;

/// Raw graph payload, classified by layout.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphShape {
    /// Editor layout: a node list plus a separate link table.
    UiGraph {
        /// Node objects with positional `widgets_values`.
        nodes: Vec<Value>,
        /// Link tuples `[id, from_node, from_slot, to_node, to_slot, type]`.
        links: Vec<Value>,
    },
    /// Execution layout: node objects keyed by node id with named inputs.
    ApiGraph(Map<String, Value>),
}

impl GraphShape {
    /// Classify `value` as a node graph, or `None` when it has no graph shape.
    pub fn classify(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => {
                if let Some(Value::Array(nodes)) = map.get(UI_NODES_FIELD) {
                    if nodes.iter().any(is_ui_node) {
                        let links = map
                            .get(UI_LINKS_FIELD)
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        return Some(Self::UiGraph {
                            nodes: nodes.clone(),
                            links,
                        });
                    }
                    return None;
                }
                if !map.is_empty() && map.values().all(is_api_node) {
                    return Some(Self::ApiGraph(map.clone()));
                }
                None
            }
            Value::Array(nodes) if nodes.iter().any(is_ui_node) => Some(Self::UiGraph {
                nodes: nodes.clone(),
                links: Vec::new(),
            }),
            _ => None,
        }
    }

    /// Parse JSON text and classify it.
    pub fn from_json_str(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        Self::classify(&value)
    }

    /// Normalize into the shared adjacency representation.
    pub fn into_graph(self) -> ParsedGraph {
        match self {
            Self::ApiGraph(map) => ParsedGraph::from_api(map),
            Self::UiGraph { nodes, links } => ParsedGraph::from_ui(&nodes, &links),
        }
    }
}

fn class_of(node: &Map<String, Value>) -> Option<&str> {
    node.get("class_type")
        .or_else(|| node.get("type"))
        .and_then(Value::as_str)
}

fn is_api_node(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|node| class_of(node).is_some() && node.contains_key("inputs"))
}

fn is_ui_node(value: &Value) -> bool {
    value.as_object().is_some_and(|node| class_of(node).is_some())
}

/// One input slot of a node.
#[derive(Clone, Debug, PartialEq)]
pub enum InputSlot {
    /// Value written directly into the node.
    Literal(Value),
    /// Output `slot` of another node.
    Link {
        /// Source node id.
        node: NodeId,
        /// Source output slot index.
        slot: u32,
    },
}

impl InputSlot {
    /// Literal value, when this slot is not a link.
    pub fn literal(&self) -> Option<&Value> {
        match self {
            Self::Literal(value) => Some(value),
            Self::Link { .. } => None,
        }
    }
}

/// A node in the normalized graph.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphNode {
    /// Node class (`KSampler`, `CLIPTextEncode`, ...).
    pub class_type: String,
    /// Optional display title.
    pub title: Option<String>,
    /// Named inputs in declaration order.
    pub inputs: IndexMap<String, InputSlot>,
    /// Output slot names in declaration order.
    pub outputs: Vec<String>,
}

impl GraphNode {
    fn literal(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).and_then(InputSlot::literal)
    }

    fn is_kind(&self, kinds: &[&str]) -> bool {
        kinds.contains(&self.class_type.as_str())
    }
}

/// Node id → node mapping, in payload order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedGraph {
    nodes: IndexMap<NodeId, GraphNode>,
}

impl ParsedGraph {
    /// Build a graph from already-normalized nodes.
    pub fn from_nodes<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, GraphNode)>,
    {
        Self {
            nodes: nodes.into_iter().collect(),
        }
    }

    /// Node lookup by id.
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    /// Nodes in payload order.
    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &GraphNode)> {
        self.nodes.iter()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` when the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn first_of_kind(&self, kinds: &[&str]) -> Option<&GraphNode> {
        self.nodes.values().find(|node| node.is_kind(kinds))
    }

    fn from_api(map: Map<String, Value>) -> Self {
        let mut nodes = IndexMap::new();
        for (id, raw) in map {
            let Value::Object(raw) = raw else {
                continue;
            };
            let mut node = GraphNode {
                class_type: class_of(&raw).unwrap_or_default().to_string(),
                title: raw
                    .get("_meta")
                    .and_then(|meta| meta.get("title"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                ..GraphNode::default()
            };
            if let Some(Value::Object(inputs)) = raw.get("inputs") {
                for (name, value) in inputs {
                    node.inputs.insert(name.clone(), api_input_slot(value));
                }
            }
            nodes.insert(id, node);
        }
        Self { nodes }
    }

    fn from_ui(raw_nodes: &[Value], raw_links: &[Value]) -> Self {
        let links = ui_link_table(raw_links);
        let mut nodes = IndexMap::new();
        for raw in raw_nodes {
            let Some(raw) = raw.as_object() else {
                continue;
            };
            let Some(id) = raw.get("id").and_then(id_string) else {
                continue;
            };
            let class_type = class_of(raw).unwrap_or_default().to_string();
            let mut node = GraphNode {
                title: raw.get("title").and_then(Value::as_str).map(str::to_string),
                ..GraphNode::default()
            };

            match raw.get("widgets_values") {
                Some(Value::Array(values)) => {
                    if let Some(names) = widget_layout(&class_type) {
                        for (name, value) in names.iter().zip(values) {
                            node.inputs
                                .insert((*name).to_string(), InputSlot::Literal(value.clone()));
                        }
                    }
                }
                Some(Value::Object(values)) => {
                    for (name, value) in values {
                        node.inputs
                            .insert(name.clone(), InputSlot::Literal(value.clone()));
                    }
                }
                _ => {}
            }

            if let Some(Value::Array(inputs)) = raw.get("inputs") {
                for input in inputs.iter().filter_map(Value::as_object) {
                    let Some(name) = input.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let link = input
                        .get("link")
                        .and_then(Value::as_u64)
                        .and_then(|link_id| links.get(&link_id));
                    if let Some((source, slot)) = link {
                        node.inputs.insert(
                            name.to_string(),
                            InputSlot::Link {
                                node: source.clone(),
                                slot: *slot,
                            },
                        );
                    }
                }
            }

            if let Some(Value::Array(outputs)) = raw.get("outputs") {
                node.outputs = outputs
                    .iter()
                    .filter_map(|output| output.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect();
            }

            node.class_type = class_type;
            nodes.insert(id, node);
        }
        Self { nodes }
    }
}

fn api_input_slot(value: &Value) -> InputSlot {
    if let Value::Array(pair) = value {
        if pair.len() == 2 {
            let slot = pair[1].as_u64().and_then(|slot| u32::try_from(slot).ok());
            if let (Some(node), Some(slot)) = (id_string(&pair[0]), slot) {
                return InputSlot::Link { node, slot };
            }
        }
    }
    InputSlot::Literal(value.clone())
}

fn id_string(value: &Value) -> Option<NodeId> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Link id → (source node, source slot), from tuple or object link entries.
fn ui_link_table(raw_links: &[Value]) -> IndexMap<u64, (NodeId, u32)> {
    let mut table = IndexMap::new();
    for link in raw_links {
        let entry = match link {
            Value::Array(parts) if parts.len() >= 3 => parts[0]
                .as_u64()
                .zip(id_string(&parts[1]))
                .zip(parts[2].as_u64()),
            Value::Object(fields) => fields
                .get("id")
                .and_then(Value::as_u64)
                .zip(fields.get("origin_id").and_then(id_string))
                .zip(fields.get("origin_slot").and_then(Value::as_u64)),
            _ => None,
        };
        // Slots beyond u32 leave the link unresolved.
        let entry = entry.and_then(|(pair, slot)| Some((pair, u32::try_from(slot).ok()?)));
        if let Some(((link_id, node), slot)) = entry {
            table.insert(link_id, (node, slot));
        }
    }
    table
}

fn widget_layout(class_type: &str) -> Option<&'static [&'static str]> {
    WIDGET_LAYOUTS
        .iter()
        .find(|(kind, _)| *kind == class_type)
        .map(|(_, names)| *names)
}

/// Settings traced out of a graph. Unresolved fields stay `None`/empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphExtraction {
    /// Sampler `seed`, or `noise_seed` for advanced samplers.
    pub seed: Option<i64>,
    /// Sampling step count.
    pub steps: Option<u32>,
    /// Classifier-free guidance scale.
    pub cfg: Option<f64>,
    /// Sampler algorithm name.
    pub sampler: Option<String>,
    /// Noise schedule name.
    pub scheduler: Option<String>,
    /// Text reached through the sampler's `positive` link.
    pub positive: Option<String>,
    /// Text reached through the sampler's `negative` link.
    pub negative: Option<String>,
    /// Checkpoint file of the first checkpoint loader.
    pub checkpoint: Option<String>,
    /// `"<name> (<strength>)"` per LoRA loader, in node order.
    pub loras: Vec<String>,
    /// Set when prompts came from the all-encoders fallback.
    pub used_prompt_fallback: bool,
}

/// Trace sampler settings, prompts, checkpoint and LoRAs out of `graph`.
pub fn trace_graph(graph: &ParsedGraph, config: &ExtractionConfig) -> GraphExtraction {
    let mut out = GraphExtraction::default();

    if let Some(sampler) = graph.first_of_kind(&SAMPLER_KINDS) {
        out.seed = sampler_input(graph, sampler, "seed")
            .and_then(value_as_i64)
            .or_else(|| sampler_input(graph, sampler, "noise_seed").and_then(value_as_i64));
        out.steps = sampler_input(graph, sampler, "steps").and_then(value_as_u32);
        out.cfg = sampler_input(graph, sampler, "cfg").and_then(value_as_f64);
        out.sampler = sampler_input(graph, sampler, "sampler_name").and_then(value_as_string);
        out.scheduler = sampler_input(graph, sampler, "scheduler").and_then(value_as_string);
        out.positive = resolve_prompt(graph, sampler, "positive");
        out.negative = resolve_prompt(graph, sampler, "negative");
    }

    if out.positive.is_none() && out.negative.is_none() {
        if let Some(joined) = gather_all_encoder_texts(graph, &config.fallback_prompt_separator) {
            out.positive = Some(joined);
            out.used_prompt_fallback = true;
        }
    }

    out.checkpoint = graph
        .first_of_kind(&CHECKPOINT_KINDS)
        .and_then(|node| node.literal("ckpt_name"))
        .and_then(value_as_string);
    out.loras = collect_loras(graph);
    out
}

/// Sampler input value, following one link hop to a primitive node when needed.
fn sampler_input<'a>(graph: &'a ParsedGraph, node: &'a GraphNode, name: &str) -> Option<&'a Value> {
    match node.inputs.get(name)? {
        InputSlot::Literal(value) => Some(value),
        InputSlot::Link { node: source, .. } => {
            let source = graph.node(source)?;
            source.literal(name).or_else(|| source.literal("value"))
        }
    }
}

/// Text of the encoder node linked from the sampler's `input` slot.
fn resolve_prompt(graph: &ParsedGraph, sampler: &GraphNode, input: &str) -> Option<String> {
    let InputSlot::Link { node, .. } = sampler.inputs.get(input)? else {
        return None;
    };
    let source = graph.node(node)?;
    if !source.is_kind(&PROMPT_SOURCE_KINDS) {
        return None;
    }
    source
        .literal("text")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Best-effort prompt: every non-blank encoder text in the graph, joined.
///
/// Imprecise when the graph holds several independent prompts; only used
/// when sampler-rooted resolution found nothing.
pub fn gather_all_encoder_texts(graph: &ParsedGraph, separator: &str) -> Option<String> {
    let texts: Vec<&str> = graph
        .nodes
        .values()
        .filter(|node| node.is_kind(&TEXT_ENCODER_KINDS))
        .filter_map(|node| node.literal("text").and_then(Value::as_str))
        .filter(|text| !text.trim().is_empty())
        .collect();
    (!texts.is_empty()).then(|| texts.join(separator))
}

fn collect_loras(graph: &ParsedGraph) -> Vec<String> {
    graph
        .nodes
        .values()
        .filter(|node| node.is_kind(&LORA_KINDS))
        .filter_map(|node| {
            let name = node
                .literal("lora_name")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())?;
            let strength = node
                .literal("strength_model")
                .map(render_value)
                .unwrap_or_else(|| "1.0".to_string());
            Some(format!("{name} ({strength})"))
        })
        .collect()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
