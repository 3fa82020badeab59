// Actions are the only way the outside world changes a ControlNetState.
// Each one is a single user action (or backend event), and reduce() applies it in full.

use anyhow::Result;
use log::trace;
use serde::{Deserialize, Serialize};

use super::{ControlNetConfig, ControlNetState, ProcessorType};
use crate::models::{ControlNetModelRef, ImageDto};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlNetAction {
    EnabledToggled,
    Added {
        id: String,
        #[serde(default)]
        config: Option<Box<ControlNetConfig>>,
    },
    AddedFromImage {
        id: String,
        control_image: ImageDto,
    },
    Removed {
        id: String,
    },
    Toggled {
        id: String,
    },
    ImageChanged {
        id: String,
        control_image: Option<ImageDto>,
    },
    PreprocessedToggled {
        id: String,
    },
    ProcessedImageChanged {
        id: String,
        processed_control_image: Option<ImageDto>,
    },
    ModelChanged {
        id: String,
        model: ControlNetModelRef,
    },
    WeightChanged {
        id: String,
        weight: f32,
    },
    BeginStepPctChanged {
        id: String,
        begin_step_pct: f32,
    },
    EndStepPctChanged {
        id: String,
        end_step_pct: f32,
    },
    ProcessorParamsChanged {
        id: String,
        changes: serde_json::Map<String, serde_json::Value>,
    },
    ProcessorTypeChanged {
        id: String,
        processor_type: ProcessorType,
    },
    /// Sent when an image-processing request for this ControlNet goes to the backend.
    ImageProcessed {
        id: String,
    },
}

impl ControlNetState {
    pub fn reduce(&mut self, action: ControlNetAction) -> Result<()> {
        trace!("Reducing {:?}", action);
        match action {
            ControlNetAction::EnabledToggled => self.toggle_collection_enabled(),
            ControlNetAction::Added { id, config } => self.add(&id, config.map(|c| *c)),
            ControlNetAction::AddedFromImage { id, control_image } => self.add_from_image(&id, control_image),
            ControlNetAction::Removed { id } => {
                self.remove(&id);
            }
            ControlNetAction::Toggled { id } => self.toggle_enabled(&id)?,
            ControlNetAction::ImageChanged { id, control_image } => self.set_control_image(&id, control_image)?,
            ControlNetAction::PreprocessedToggled { id } => self.toggle_preprocessed(&id)?,
            ControlNetAction::ProcessedImageChanged {
                id,
                processed_control_image,
            } => self.set_processed_image(&id, processed_control_image)?,
            ControlNetAction::ModelChanged { id, model } => self.set_model(&id, model)?,
            ControlNetAction::WeightChanged { id, weight } => self.set_weight(&id, weight)?,
            ControlNetAction::BeginStepPctChanged { id, begin_step_pct } => {
                self.set_begin_step_pct(&id, begin_step_pct)?
            }
            ControlNetAction::EndStepPctChanged { id, end_step_pct } => self.set_end_step_pct(&id, end_step_pct)?,
            ControlNetAction::ProcessorParamsChanged { id, changes } => self.merge_processor_params(&id, &changes)?,
            ControlNetAction::ProcessorTypeChanged { id, processor_type } => {
                self.set_processor_type(&id, processor_type)?
            }
            ControlNetAction::ImageProcessed { id } => self.on_image_processed(&id)?,
        }
        Ok(())
    }

    /// Applies actions in order, stopping at the first one that fails.
    pub fn reduce_all(&mut self, actions: impl IntoIterator<Item = ControlNetAction>) -> Result<()> {
        for (i, action) in actions.into_iter().enumerate() {
            self.reduce(action)
                .map_err(|e| e.context(format!("While applying ControlNet action #{}", i + 1)))?;
        }
        Ok(())
    }
}
