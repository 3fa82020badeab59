// Base graphs, one per variant.
//
// These hold the nodes every generation of that variant needs, wired together except for
// the VAE and the ControlNets. Those depend on user state and are spliced in afterwards by
// add_vae_to_graph and add_controlnets_to_graph, which rely on the node ids set up here.

use anyhow::{Context, Result};
use log::debug;

use super::{
    Denoise, Graph, GraphVariant, Invocation, Metadata, Node, CANVAS_OUTPUT, IMAGE_TO_LATENTS, INPAINT_IMAGE,
    LATENTS_TO_IMAGE, METADATA_ACCUMULATOR, NEGATIVE_CONDITIONING, NOISE, POSITIVE_CONDITIONING,
};
use crate::{generation::GenerationSettings, models::ModelLoader};

/// Builds the base graph for `variant`.
/// Image-to-image variants need an init image, and inpaint/outpaint also need a mask.
pub fn build_graph(variant: GraphVariant, settings: &GenerationSettings) -> Result<Graph> {
    let loader = settings.model_loader();
    debug!("Building {} with {:?} loader", variant, loader);
    let mut graph = Graph::new(variant);

    add_model_loader(&mut graph, settings, loader);
    add_conditioning(&mut graph, settings, loader);

    let init_image = if variant.needs_init_image() {
        Some(
            settings
                .init_image
                .as_ref()
                .with_context(|| format!("{} needs an init image", variant))?,
        )
    } else {
        None
    };
    let mask = if variant.needs_mask() {
        Some(
            settings
                .mask_image
                .as_ref()
                .with_context(|| format!("{} needs a mask image", variant))?,
        )
    } else {
        None
    };

    graph.add_node(Node::intermediate(
        NOISE,
        Invocation::Noise {
            seed: settings.seed,
            width: settings.width,
            height: settings.height,
            use_cpu: true,
        },
    ));

    let denoise_id = variant.denoise_node_id();
    let denoising_start = if variant.needs_init_image() {
        1.0 - settings.strength
    } else {
        0.0
    };
    let denoise = Denoise {
        cfg_scale: settings.cfg_scale,
        scheduler: settings.scheduler.clone(),
        steps: settings.steps,
        denoising_start,
        denoising_end: 1.0,
        mask: mask.map(Into::into),
    };
    let denoise = match loader {
        ModelLoader::Main => Invocation::DenoiseLatents(denoise),
        ModelLoader::Onnx => Invocation::TextToLatentsOnnx(denoise),
    };
    graph.add_node(Node::intermediate(denoise_id, denoise));
    graph.connect(loader.node_id(), "unet", denoise_id, "unet");
    graph.connect(POSITIVE_CONDITIONING, "conditioning", denoise_id, "positive_conditioning");
    graph.connect(NEGATIVE_CONDITIONING, "conditioning", denoise_id, "negative_conditioning");
    graph.connect(NOISE, "noise", denoise_id, "noise");

    // The encoder for the init image, if there is one.
    let encoder_id = match variant {
        GraphVariant::TextToImage | GraphVariant::CanvasTextToImage => None,
        GraphVariant::ImageToImage | GraphVariant::CanvasImageToImage => Some(IMAGE_TO_LATENTS),
        GraphVariant::CanvasInpaint | GraphVariant::CanvasOutpaint => Some(INPAINT_IMAGE),
    };
    if let Some(encoder_id) = encoder_id {
        graph.add_node(Node::intermediate(
            encoder_id,
            Invocation::ImageToLatents {
                image: init_image.map(Into::into),
                fp32: false,
            },
        ));
        graph.connect(encoder_id, "latents", denoise_id, "latents");
    }

    // Canvas image graphs hand their result back to the canvas rather than the gallery.
    let output_id = match variant {
        GraphVariant::CanvasTextToImage | GraphVariant::CanvasImageToImage => CANVAS_OUTPUT,
        _ => LATENTS_TO_IMAGE,
    };
    let decoder = match loader {
        ModelLoader::Main => Invocation::LatentsToImage { fp32: false },
        ModelLoader::Onnx => Invocation::LatentsToImageOnnx {},
    };
    graph.add_node(Node::output(output_id, decoder));
    graph.connect(denoise_id, "latents", output_id, "latents");

    add_metadata(&mut graph, variant, settings);
    graph.connect(METADATA_ACCUMULATOR, "metadata", output_id, "metadata");

    Ok(graph)
}

fn add_model_loader(graph: &mut Graph, settings: &GenerationSettings, loader: ModelLoader) {
    let model = settings.model.model_ref();
    let invocation = match loader {
        ModelLoader::Main => Invocation::MainModelLoader { model },
        ModelLoader::Onnx => Invocation::OnnxModelLoader { model },
    };
    graph.add_node(Node::intermediate(loader.node_id(), invocation));
}

fn add_conditioning(graph: &mut Graph, settings: &GenerationSettings, loader: ModelLoader) {
    let prompt_node = |prompt: &str| match loader {
        ModelLoader::Main => Invocation::Compel {
            prompt: prompt.to_string(),
        },
        ModelLoader::Onnx => Invocation::PromptOnnx {
            prompt: prompt.to_string(),
        },
    };
    graph.add_node(Node::intermediate(POSITIVE_CONDITIONING, prompt_node(&settings.positive_prompt)));
    graph.add_node(Node::intermediate(NEGATIVE_CONDITIONING, prompt_node(&settings.negative_prompt)));
    graph.connect(loader.node_id(), "clip", POSITIVE_CONDITIONING, "clip");
    graph.connect(loader.node_id(), "clip", NEGATIVE_CONDITIONING, "clip");
}

fn add_metadata(graph: &mut Graph, variant: GraphVariant, settings: &GenerationSettings) {
    let generation_mode = match variant {
        GraphVariant::TextToImage => "txt2img",
        GraphVariant::ImageToImage => "img2img",
        GraphVariant::CanvasTextToImage => "unifiedCanvas.txt2img",
        GraphVariant::CanvasImageToImage => "unifiedCanvas.img2img",
        GraphVariant::CanvasInpaint => "unifiedCanvas.inpaint",
        GraphVariant::CanvasOutpaint => "unifiedCanvas.outpaint",
    };
    let metadata = Metadata {
        generation_mode: generation_mode.to_string(),
        positive_prompt: settings.positive_prompt.clone(),
        negative_prompt: settings.negative_prompt.clone(),
        cfg_scale: settings.cfg_scale,
        seed: settings.seed,
        steps: settings.steps,
        width: settings.width,
        height: settings.height,
        scheduler: settings.scheduler.clone(),
        model: settings.model.model_ref(),
        strength: variant.needs_init_image().then_some(settings.strength),
        vae: None,
        controlnets: Vec::new(),
    };
    graph.add_node(Node::intermediate(
        METADATA_ACCUMULATOR,
        Invocation::MetadataAccumulator(Box::new(metadata)),
    ));
}
