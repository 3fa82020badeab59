// Model and image references shared by the ControlNet store and the graph builders.
// These mirror the shapes the backend's API speaks, so they all round-trip through serde
// with the backend's field names.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseModelType {
    #[serde(rename = "sd-1")]
    Sd1,
    #[serde(rename = "sd-2")]
    Sd2,
    #[serde(rename = "sdxl")]
    Sdxl,
    #[serde(rename = "sdxl-refiner")]
    SdxlRefiner,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariantType {
    Normal,
    Inpaint,
    Depth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelError {
    NotFound,
}

/// An uploaded image, as far as we care about it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDto {
    pub image_name: String,
    pub width: u32,
    pub height: u32,
}

/// What a graph node gets when it takes an image input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageField {
    pub image_name: String,
}

impl From<&ImageDto> for ImageField {
    fn from(image: &ImageDto) -> Self {
        Self {
            image_name: image.image_name.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlNetModelRef {
    pub model_name: String,
    pub base_model: BaseModelType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaeModelRef {
    pub model_name: String,
    pub base_model: BaseModelType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainModelRef {
    pub model_name: String,
    pub base_model: BaseModelType,
}

/// ONNX Stable Diffusion 2 model configuration, as reported by the model manager.
/// `model_format` is always null for these; we keep it so the record round-trips.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OnnxModelConfig {
    pub name: String,
    pub base_model: BaseModelType,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub model_format: Option<()>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ModelError>,
    pub variant: ModelVariantType,
    pub prediction_type: SchedulerPredictionType,
    pub upcast_attention: bool,
}

/// The main model of a generation. Which kind it is decides which loader node
/// the graph uses, and from there which field the default VAE comes out of.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MainModelConfig {
    Main(MainModelRef),
    Onnx(OnnxModelConfig),
}

impl MainModelConfig {
    pub fn model_ref(&self) -> MainModelRef {
        match self {
            MainModelConfig::Main(model) => model.clone(),
            MainModelConfig::Onnx(config) => MainModelRef {
                model_name: config.name.clone(),
                base_model: config.base_model,
            },
        }
    }

    pub fn loader(&self) -> ModelLoader {
        match self {
            MainModelConfig::Main(_) => ModelLoader::Main,
            MainModelConfig::Onnx(_) => ModelLoader::Onnx,
        }
    }
}

impl Default for MainModelConfig {
    fn default() -> Self {
        MainModelConfig::Main(MainModelRef {
            model_name: "stable-diffusion-v1-5".to_string(),
            base_model: BaseModelType::Sd1,
        })
    }
}

/// Which runtime the model loader node belongs to.
/// ONNX loaders expose the decoder half of the VAE under a different output name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelLoader {
    #[default]
    Main,
    Onnx,
}

impl ModelLoader {
    pub fn node_id(self) -> &'static str {
        match self {
            ModelLoader::Main => crate::graph::MAIN_MODEL_LOADER,
            ModelLoader::Onnx => crate::graph::ONNX_MODEL_LOADER,
        }
    }

    pub fn vae_output_field(self) -> &'static str {
        match self {
            ModelLoader::Main => "vae",
            ModelLoader::Onnx => "vae_decoder",
        }
    }
}
