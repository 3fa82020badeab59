pub mod config;
pub mod controlnet;
pub mod generation;
pub mod graph;
pub mod models;

use anyhow::{Context, Result};
use log::info;

use crate::{
    config::SessionConfig,
    graph::{builders::build_graph, controlnet::add_controlnets_to_graph, vae::add_vae_to_graph, Graph},
};

/// Turns a session into the graph we send to the backend.
/// The ControlNets go in before the VAE, and the whole thing is validated at the end.
pub fn assemble_graph(session: &SessionConfig) -> Result<Graph> {
    let settings = session
        .generation
        .clone()
        .resolve()
        .context("Invalid generation settings")?;
    let state = session.controlnet_state()?;

    let mut graph = build_graph(session.variant, &settings)?;
    let controlnets = add_controlnets_to_graph(&mut graph, &state);
    add_vae_to_graph(&mut graph, settings.vae.as_ref(), settings.model_loader());
    graph
        .validate()
        .with_context(|| format!("Assembled an invalid {}", session.variant))?;
    info!(
        "Assembled {} with {} nodes, {} edges and {} ControlNets",
        graph.id,
        graph.nodes.len(),
        graph.edges.len(),
        controlnets
    );
    Ok(graph)
}
