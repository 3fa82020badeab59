// VAE wiring.
//
// Every node that encodes or decodes latents needs a VAE. If the user picked one, we add a
// VAE loader node and feed everything from that; otherwise the VAE comes straight out of the
// main model loader. ONNX loaders call that output "vae_decoder" instead of "vae".

use log::debug;

use super::{
    Graph, GraphVariant, Invocation, Node, CANVAS_OUTPUT, IMAGE_TO_LATENTS, INPAINT_IMAGE, LATENTS_TO_IMAGE,
    METADATA_ACCUMULATOR, VAE_LOADER,
};
use crate::models::{ModelLoader, VaeModelRef};

/// The nodes in each variant that take a VAE, in the order their edges are added.
fn vae_consumers(variant: GraphVariant) -> &'static [&'static str] {
    match variant {
        GraphVariant::TextToImage => &[LATENTS_TO_IMAGE],
        GraphVariant::ImageToImage => &[LATENTS_TO_IMAGE, IMAGE_TO_LATENTS],
        GraphVariant::CanvasTextToImage => &[CANVAS_OUTPUT],
        GraphVariant::CanvasImageToImage => &[CANVAS_OUTPUT, IMAGE_TO_LATENTS],
        GraphVariant::CanvasInpaint | GraphVariant::CanvasOutpaint => &[INPAINT_IMAGE, LATENTS_TO_IMAGE],
    }
}

/// Adds the VAE to `graph`.
///
/// `vae` is the user's explicit choice, or None to use the one bundled with the main model.
/// The consumer nodes for the graph's variant must already be in the graph; this doesn't
/// check, so call Graph::validate afterwards if you aren't sure.
pub fn add_vae_to_graph(graph: &mut Graph, vae: Option<&VaeModelRef>, loader: ModelLoader) {
    let (source_node, source_field) = match vae {
        Some(vae) => {
            graph.add_node(Node::intermediate(
                VAE_LOADER,
                Invocation::VaeLoader {
                    vae_model: vae.clone(),
                },
            ));
            (VAE_LOADER, "vae")
        }
        None => (loader.node_id(), loader.vae_output_field()),
    };
    debug!("Wiring VAE for {} from {}.{}", graph.id, source_node, source_field);

    for consumer in vae_consumers(graph.id) {
        graph.connect(source_node, source_field, consumer, "vae");
    }

    if let Some(vae) = vae {
        if let Some(Node {
            invocation: Invocation::MetadataAccumulator(metadata),
            ..
        }) = graph.node_mut(METADATA_ACCUMULATOR)
        {
            metadata.vae = Some(vae.clone());
        }
    }
}
