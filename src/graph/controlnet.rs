// ControlNet wiring.
//
// Each enabled ControlNet that has an image becomes a controlnet node. They are all
// collected into one list, which feeds the "control" input of the variant's denoising node.

use log::{debug, trace};

use super::{ControlField, Graph, Invocation, Node, CONTROL_NET_COLLECT, METADATA_ACCUMULATOR};
use crate::controlnet::{ControlNetConfig, ControlNetState};

pub fn controlnet_node_id(controlnet: &ControlNetConfig) -> String {
    format!("control_net_{}", controlnet.id)
}

fn control_field(controlnet: &ControlNetConfig) -> Option<ControlField> {
    let image = controlnet.conditioning_image()?;
    Some(ControlField {
        image: image.into(),
        control_model: controlnet.model.clone(),
        control_weight: controlnet.weight,
        begin_step_percent: controlnet.begin_step_pct,
        end_step_percent: controlnet.end_step_pct,
    })
}

/// Adds the user's ControlNets to `graph`. Does nothing if ControlNets are switched off,
/// or if none of the enabled ones has an image yet.
/// Returns how many controlnet nodes were added.
pub fn add_controlnets_to_graph(graph: &mut Graph, state: &ControlNetState) -> usize {
    if !state.is_enabled {
        trace!("ControlNets disabled, leaving {} alone", graph.id);
        return 0;
    }
    let fields = state
        .enabled_controlnets()
        .filter_map(|controlnet| {
            let field = control_field(controlnet);
            if field.is_none() {
                debug!("Skipping ControlNet {} without an image", controlnet.id);
            }
            field.map(|field| (controlnet_node_id(controlnet), field))
        })
        .collect::<Vec<_>>();
    if fields.is_empty() {
        return 0;
    }

    let denoise_id = graph.id.denoise_node_id();
    graph.add_node(Node::intermediate(CONTROL_NET_COLLECT, Invocation::Collect {}));
    graph.connect(CONTROL_NET_COLLECT, "collection", denoise_id, "control");

    for (node_id, field) in &fields {
        graph.add_node(Node::intermediate(node_id, Invocation::ControlNet(field.clone())));
        graph.connect(node_id, "control", CONTROL_NET_COLLECT, "item");
    }

    if let Some(Node {
        invocation: Invocation::MetadataAccumulator(metadata),
        ..
    }) = graph.node_mut(METADATA_ACCUMULATOR)
    {
        metadata
            .controlnets
            .extend(fields.iter().map(|(_, field)| field.clone()));
    }
    debug!("Added {} ControlNets to {}", fields.len(), graph.id);
    fields.len()
}
