// Pipeline graphs.
//
// Basically this provides a type-safe way to generate the node graphs the backend executes.
// A graph is a set of nodes keyed by id plus a list of edges, each connecting an output
// field of one node to an input field of another.

pub mod builders;
pub mod controlnet;
pub mod vae;

use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::{bail, Result};
use log::trace;
use serde::{Deserialize, Serialize};

use crate::models::{ControlNetModelRef, ImageField, MainModelRef, VaeModelRef};

// Node ids. These are fixed per graph, so wiring code can find nodes by name.
pub const POSITIVE_CONDITIONING: &str = "positive_conditioning";
pub const NEGATIVE_CONDITIONING: &str = "negative_conditioning";
pub const NOISE: &str = "noise";
pub const TEXT_TO_LATENTS: &str = "text_to_latents";
pub const LATENTS_TO_LATENTS: &str = "latents_to_latents";
pub const LATENTS_TO_IMAGE: &str = "latents_to_image";
pub const IMAGE_TO_LATENTS: &str = "image_to_latents";
pub const MAIN_MODEL_LOADER: &str = "main_model_loader";
pub const ONNX_MODEL_LOADER: &str = "onnx_model_loader";
pub const VAE_LOADER: &str = "vae_loader";
pub const CANVAS_OUTPUT: &str = "canvas_output";
pub const INPAINT: &str = "inpaint";
pub const INPAINT_IMAGE: &str = "inpaint_image";
pub const CONTROL_NET_COLLECT: &str = "control_net_collect";
pub const METADATA_ACCUMULATOR: &str = "metadata_accumulator";

/// Which pipeline a graph describes. Each one has a fixed set of nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphVariant {
    #[serde(rename = "text_to_image_graph")]
    TextToImage,
    #[serde(rename = "image_to_image_graph")]
    ImageToImage,
    #[serde(rename = "canvas_text_to_image_graph")]
    CanvasTextToImage,
    #[serde(rename = "canvas_image_to_image_graph")]
    CanvasImageToImage,
    #[serde(rename = "canvas_inpaint_graph")]
    CanvasInpaint,
    #[serde(rename = "canvas_outpaint_graph")]
    CanvasOutpaint,
}

impl GraphVariant {
    pub const ALL: [GraphVariant; 6] = [
        GraphVariant::TextToImage,
        GraphVariant::ImageToImage,
        GraphVariant::CanvasTextToImage,
        GraphVariant::CanvasImageToImage,
        GraphVariant::CanvasInpaint,
        GraphVariant::CanvasOutpaint,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GraphVariant::TextToImage => "text_to_image_graph",
            GraphVariant::ImageToImage => "image_to_image_graph",
            GraphVariant::CanvasTextToImage => "canvas_text_to_image_graph",
            GraphVariant::CanvasImageToImage => "canvas_image_to_image_graph",
            GraphVariant::CanvasInpaint => "canvas_inpaint_graph",
            GraphVariant::CanvasOutpaint => "canvas_outpaint_graph",
        }
    }

    /// The node that does the denoising, and so takes the ControlNet input.
    pub fn denoise_node_id(self) -> &'static str {
        match self {
            GraphVariant::TextToImage | GraphVariant::CanvasTextToImage => TEXT_TO_LATENTS,
            GraphVariant::ImageToImage | GraphVariant::CanvasImageToImage => LATENTS_TO_LATENTS,
            GraphVariant::CanvasInpaint | GraphVariant::CanvasOutpaint => INPAINT,
        }
    }

    /// Whether the graph starts from an existing image.
    pub fn needs_init_image(self) -> bool {
        !matches!(self, GraphVariant::TextToImage | GraphVariant::CanvasTextToImage)
    }

    pub fn needs_mask(self) -> bool {
        matches!(self, GraphVariant::CanvasInpaint | GraphVariant::CanvasOutpaint)
    }
}

impl fmt::Display for GraphVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GraphVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match GraphVariant::ALL.iter().find(|v| v.name() == s) {
            Some(variant) => Ok(*variant),
            None => bail!("Unsupported graph variant: {}", s),
        }
    }
}

/// Parameters shared by the denoising nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Denoise {
    pub cfg_scale: f32,
    pub scheduler: String,
    pub steps: u32,
    pub denoising_start: f32,
    pub denoising_end: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<ImageField>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlField {
    pub image: ImageField,
    pub control_model: ControlNetModelRef,
    pub control_weight: f32,
    pub begin_step_percent: f32,
    pub end_step_percent: f32,
}

/// Everything we record about a generation so it can be shown again later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub generation_mode: String,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub cfg_scale: f32,
    pub seed: u32,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub scheduler: String,
    pub model: MainModelRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vae: Option<VaeModelRef>,
    #[serde(default)]
    pub controlnets: Vec<ControlField>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Invocation {
    MainModelLoader {
        model: MainModelRef,
    },
    OnnxModelLoader {
        model: MainModelRef,
    },
    VaeLoader {
        vae_model: VaeModelRef,
    },
    Compel {
        prompt: String,
    },
    PromptOnnx {
        prompt: String,
    },
    Noise {
        seed: u32,
        width: u32,
        height: u32,
        use_cpu: bool,
    },
    DenoiseLatents(Denoise),
    #[serde(rename = "t2l_onnx")]
    TextToLatentsOnnx(Denoise),
    #[serde(rename = "l2i")]
    LatentsToImage {
        fp32: bool,
    },
    #[serde(rename = "l2i_onnx")]
    LatentsToImageOnnx {},
    #[serde(rename = "i2l")]
    ImageToLatents {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<ImageField>,
        fp32: bool,
    },
    #[serde(rename = "controlnet")]
    ControlNet(ControlField),
    Collect {},
    MetadataAccumulator(Box<Metadata>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub is_intermediate: bool,
    #[serde(flatten)]
    pub invocation: Invocation,
}

impl Node {
    /// Intermediate nodes don't produce anything the user gets to see.
    pub fn intermediate(id: &str, invocation: Invocation) -> Self {
        Self {
            id: id.to_string(),
            is_intermediate: true,
            invocation,
        }
    }

    pub fn output(id: &str, invocation: Invocation) -> Self {
        Self {
            id: id.to_string(),
            is_intermediate: false,
            invocation,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeConnection {
    pub node_id: String,
    pub field: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: EdgeConnection,
    pub destination: EdgeConnection,
}

impl Edge {
    pub fn new(source_node: &str, source_field: &str, destination_node: &str, destination_field: &str) -> Self {
        Self {
            source: EdgeConnection {
                node_id: source_node.to_string(),
                field: source_field.to_string(),
            },
            destination: EdgeConnection {
                node_id: destination_node.to_string(),
                field: destination_field.to_string(),
            },
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source.node_id, self.source.field, self.destination.node_id, self.destination.field
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: GraphVariant,
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(id: GraphVariant) -> Self {
        Self {
            id,
            nodes: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    /// Inserts a node under its own id, returning whatever was there before.
    pub fn add_node(&mut self, node: Node) -> Option<Node> {
        trace!("Adding node {} to {}", node.id, self.id);
        self.nodes.insert(node.id.clone(), node)
    }

    pub fn add_edge(&mut self, edge: Edge) {
        trace!("Adding edge {} to {}", edge, self.id);
        self.edges.push(edge);
    }

    pub fn connect(&mut self, source_node: &str, source_field: &str, destination_node: &str, destination_field: &str) {
        self.add_edge(Edge::new(source_node, source_field, destination_node, destination_field));
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn edges_into<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.destination.node_id == node_id)
    }

    /// Checks the graph is something the backend can execute:
    /// - Every edge connects two nodes that exist.
    /// - No input field is fed by more than one edge, except on collect nodes.
    pub fn validate(&self) -> Result<()> {
        let mut fed = std::collections::HashSet::new();
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.source.node_id) {
                bail!("Edge {} in {} has a missing source node", edge, self.id);
            }
            let Some(destination) = self.nodes.get(&edge.destination.node_id) else {
                bail!("Edge {} in {} has a missing destination node", edge, self.id);
            };
            if matches!(destination.invocation, Invocation::Collect {}) {
                continue;
            }
            if !fed.insert(&edge.destination) {
                bail!("Input {}.{} in {} is connected twice", edge.destination.node_id, edge.destination.field, self.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variant_names() {
        for variant in GraphVariant::ALL {
            assert_eq!(variant.name().parse::<GraphVariant>().unwrap(), variant);
            assert_eq!(serde_json::to_value(variant).unwrap(), json!(variant.name()));
        }
        let err = "sdxl_text_to_image_graph".parse::<GraphVariant>().unwrap_err();
        assert_eq!(err.to_string(), "Unsupported graph variant: sdxl_text_to_image_graph");
        assert!(serde_json::from_value::<GraphVariant>(json!("nonsense")).is_err());
    }

    #[test]
    fn test_node_serialization() {
        let node = Node::intermediate(
            VAE_LOADER,
            Invocation::VaeLoader {
                vae_model: VaeModelRef {
                    model_name: "sd-vae-ft-mse".to_string(),
                    base_model: crate::models::BaseModelType::Sd1,
                },
            },
        );
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "vae_loader",
                "type": "vae_loader",
                "is_intermediate": true,
                "vae_model": {"model_name": "sd-vae-ft-mse", "base_model": "sd-1"},
            })
        );
        assert_eq!(serde_json::from_value::<Node>(value).unwrap(), node);

        let l2i = Node::output(LATENTS_TO_IMAGE, Invocation::LatentsToImage { fp32: false });
        assert_eq!(serde_json::to_value(&l2i).unwrap()["type"], json!("l2i"));
    }

    #[test]
    fn test_validate() {
        let mut graph = Graph::new(GraphVariant::TextToImage);
        graph.add_node(Node::output(LATENTS_TO_IMAGE, Invocation::LatentsToImage { fp32: false }));
        graph.connect(VAE_LOADER, "vae", LATENTS_TO_IMAGE, "vae");
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("missing source node"), "{}", err);

        graph.edges.clear();
        graph.add_node(Node::intermediate(CONTROL_NET_COLLECT, Invocation::Collect {}));
        graph.add_node(Node::intermediate(NOISE, Invocation::Noise { seed: 0, width: 8, height: 8, use_cpu: true }));
        graph.connect(NOISE, "noise", CONTROL_NET_COLLECT, "item");
        graph.connect(NOISE, "noise", CONTROL_NET_COLLECT, "item");
        graph.validate().unwrap();

        graph.connect(NOISE, "noise", LATENTS_TO_IMAGE, "latents");
        graph.connect(NOISE, "noise", LATENTS_TO_IMAGE, "latents");
        assert!(graph.validate().is_err());
        assert_eq!(graph.edges_into(LATENTS_TO_IMAGE).count(), 2);
    }
}
