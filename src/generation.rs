// Generation settings: everything about a request that isn't a ControlNet.
// The graph builders read these; nothing here knows about graphs.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{ImageDto, MainModelConfig, ModelLoader, VaeModelRef};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub cfg_scale: f32,
    pub seed: u32,
    pub scheduler: String,
    /// How much of the init image to throw away, for image-to-image graphs.
    pub strength: f32,
    // Width and height can also be derived from `aspect_ratio`, see resolve().
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    pub model: MainModelConfig,
    /// None means "use the VAE bundled with the main model".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vae: Option<VaeModelRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_image: Option<ImageDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_image: Option<ImageDto>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            positive_prompt: "".to_string(),
            negative_prompt: "".to_string(),
            steps: 50,
            cfg_scale: 7.5,
            seed: 0,
            scheduler: "euler".to_string(),
            strength: 0.75,
            width: 512,
            height: 512,
            aspect_ratio: None,
            model: MainModelConfig::default(),
            vae: None,
            init_image: None,
            mask_image: None,
        }
    }
}

/// Turns "W:H" into a width and height with the same pixel count as 512x512.
/// Both come out as multiples of 8, and the ratio has to be between 1:4 and 4:1.
pub fn parse_aspect_ratio(value: &str) -> Result<(u32, u32)> {
    let (ar_x, ar_y) = value.split_once(':').context("AR must be in the form W:H")?;
    let ar_x: f32 = ar_x.trim().parse().context("AR must be in the form W:H")?;
    let ar_y: f32 = ar_y.trim().parse().context("AR must be in the form W:H")?;
    if ar_x <= 0.0 || ar_y <= 0.0 {
        bail!("AR must be in the form W:H");
    }
    let ar = ar_x / ar_y;
    if !(0.25..=4.0).contains(&ar) {
        bail!("Aspect ratio must be between 1:4 and 4:1");
    }
    let mut width = (512.0 * ar.sqrt()).round() as u32;
    let mut height = (512.0 / ar.sqrt()).round() as u32;
    // Shrink dimensions so that they're multiples of 8.
    width -= width % 8;
    height -= height % 8;
    Ok((width, height))
}

impl GenerationSettings {
    pub fn model_loader(&self) -> ModelLoader {
        self.model.loader()
    }

    /// Applies the aspect ratio, if any, and sanity-checks the rest.
    pub fn resolve(mut self) -> Result<Self> {
        if let Some(ar) = &self.aspect_ratio {
            (self.width, self.height) = parse_aspect_ratio(ar)?;
        }
        if self.width % 8 != 0 || self.height % 8 != 0 {
            bail!("Width and height must be multiples of 8, got {}x{}", self.width, self.height);
        }
        if self.steps < 1 {
            bail!("Steps must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.strength) {
            bail!("Strength must be between 0 and 1");
        }
        Ok(self)
    }
}
