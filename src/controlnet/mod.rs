// The ControlNet store.
//
// This keeps the list of ControlNets the user has attached to a generation request.
// Every operation is synchronous and applied to completion before the next one; the UI
// clamps numeric input before it gets here, so setters don't validate ranges.
//
// Unlike a plain record lookup, every operation on a single ControlNet checks the id
// exists and fails with a readable error if it doesn't.

pub mod actions;
pub mod processors;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::models::{BaseModelType, ControlNetModelRef, ImageDto};
pub use actions::ControlNetAction;
pub use processors::{ProcessorNode, ProcessorParams, ProcessorType};

lazy_static! {
    /// Known ControlNet models. The first one is what new ControlNets start with.
    pub static ref CONTROLNET_MODELS: Vec<ControlNetModelRef> = [
        "lllyasviel/control_v11p_sd15_canny",
        "lllyasviel/control_v11p_sd15_inpaint",
        "lllyasviel/control_v11p_sd15_mlsd",
        "lllyasviel/control_v11f1p_sd15_depth",
        "lllyasviel/control_v11p_sd15_normalbae",
        "lllyasviel/control_v11p_sd15_seg",
        "lllyasviel/control_v11p_sd15_lineart",
        "lllyasviel/control_v11p_sd15s2_lineart_anime",
        "lllyasviel/control_v11p_sd15_scribble",
        "lllyasviel/control_v11p_sd15_softedge",
        "lllyasviel/control_v11e_sd15_shuffle",
        "lllyasviel/control_v11p_sd15_openpose",
        "lllyasviel/control_v11f1e_sd15_tile",
        "lllyasviel/control_v11e_sd15_ip2p",
        "CrucibleAI/ControlNetMediaPipeFace",
    ]
    .iter()
    .map(|name| ControlNetModelRef {
        model_name: name.to_string(),
        base_model: BaseModelType::Sd1,
    })
    .collect();
}

/// Where a single ControlNet's control image is in preprocessing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Idle,
    Pending,
    Done,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlNetConfig {
    pub id: String,
    pub is_enabled: bool,
    pub model: ControlNetModelRef,
    pub weight: f32,
    pub begin_step_pct: f32,
    pub end_step_pct: f32,
    pub control_image: Option<ImageDto>,
    pub is_preprocessed: bool,
    pub processed_control_image: Option<ImageDto>,
    pub processor_node: ProcessorNode,
    #[serde(default)]
    pub processing: ProcessingStatus,
}

impl Default for ControlNetConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            is_enabled: true,
            model: CONTROLNET_MODELS[0].clone(),
            weight: 1.0,
            begin_step_pct: 0.0,
            end_step_pct: 1.0,
            control_image: None,
            is_preprocessed: false,
            processed_control_image: None,
            processor_node: ProcessorNode::default(),
            processing: ProcessingStatus::Idle,
        }
    }
}

impl ControlNetConfig {
    /// The image the backend should condition on.
    /// Preprocessed uploads are used as-is; otherwise we prefer the processor output if we have it.
    pub fn conditioning_image(&self) -> Option<&ImageDto> {
        if self.is_preprocessed {
            return self.control_image.as_ref();
        }
        self.processed_control_image.as_ref().or(self.control_image.as_ref())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlNetState {
    pub controlnets: BTreeMap<String, ControlNetConfig>,
    pub is_enabled: bool,
    /// Set when any control image is sent off for processing, cleared when any processed
    /// image comes back. It doesn't know which ControlNet it was for; see is_any_processing.
    pub is_processing_control_image: bool,
}

impl ControlNetState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&ControlNetConfig> {
        self.controlnets.get(id)
    }

    fn entity_mut(&mut self, id: &str) -> Result<&mut ControlNetConfig> {
        self.controlnets
            .get_mut(id)
            .with_context(|| format!("no such ControlNet: {}", id))
    }

    pub fn toggle_collection_enabled(&mut self) {
        self.is_enabled = !self.is_enabled;
        debug!("ControlNets are now {}", if self.is_enabled { "enabled" } else { "disabled" });
    }

    /// Inserts a ControlNet under `id`, using `config` if given and the defaults otherwise.
    /// An existing entry with the same id is replaced.
    pub fn add(&mut self, id: &str, config: Option<ControlNetConfig>) {
        let config = ControlNetConfig {
            id: id.to_string(),
            ..config.unwrap_or_default()
        };
        if self.controlnets.insert(id.to_string(), config).is_some() {
            debug!("Replaced existing ControlNet {}", id);
        } else {
            trace!("Added ControlNet {}", id);
        }
    }

    pub fn add_from_image(&mut self, id: &str, image: ImageDto) {
        let config = ControlNetConfig {
            control_image: Some(image),
            ..Default::default()
        };
        self.add(id, Some(config));
    }

    /// Copies an existing ControlNet under a fresh id, which is returned.
    /// The copy never has a processing request of its own in flight.
    pub fn duplicate(&mut self, id: &str) -> Result<String> {
        let mut copy = self
            .controlnets
            .get(id)
            .cloned()
            .with_context(|| format!("no such ControlNet: {}", id))?;
        copy.processing = if copy.processed_control_image.is_some() {
            ProcessingStatus::Done
        } else {
            ProcessingStatus::Idle
        };
        let new_id = uuid::Uuid::new_v4().to_string();
        self.add(&new_id, Some(copy));
        Ok(new_id)
    }

    /// Removing something that isn't there is fine.
    pub fn remove(&mut self, id: &str) -> Option<ControlNetConfig> {
        let removed = self.controlnets.remove(id);
        if removed.is_none() {
            trace!("Tried to remove missing ControlNet {}", id);
        }
        removed
    }

    pub fn toggle_enabled(&mut self, id: &str) -> Result<()> {
        let controlnet = self.entity_mut(id)?;
        controlnet.is_enabled = !controlnet.is_enabled;
        Ok(())
    }

    pub fn set_control_image(&mut self, id: &str, image: Option<ImageDto>) -> Result<()> {
        let controlnet = self.entity_mut(id)?;
        let needs_processing = image.is_some() && !controlnet.is_preprocessed;
        controlnet.control_image = image;
        controlnet.processed_control_image = None;
        controlnet.processing = if needs_processing {
            ProcessingStatus::Pending
        } else {
            ProcessingStatus::Idle
        };
        if needs_processing {
            self.is_processing_control_image = true;
        }
        Ok(())
    }

    /// A preprocessed image is used as-is, so a pending request for it is no longer waited on.
    /// Switching back doesn't start a new request; setting the image again does.
    pub fn toggle_preprocessed(&mut self, id: &str) -> Result<()> {
        let controlnet = self.entity_mut(id)?;
        controlnet.is_preprocessed = !controlnet.is_preprocessed;
        if controlnet.is_preprocessed && controlnet.processing == ProcessingStatus::Pending {
            controlnet.processing = ProcessingStatus::Idle;
        }
        Ok(())
    }

    /// Stores the processor output. This clears the collection-wide busy flag even if
    /// some other ControlNet is still waiting on its own image.
    pub fn set_processed_image(&mut self, id: &str, image: Option<ImageDto>) -> Result<()> {
        let controlnet = self.entity_mut(id)?;
        controlnet.processing = if image.is_some() {
            ProcessingStatus::Done
        } else {
            ProcessingStatus::Idle
        };
        controlnet.processed_control_image = image;
        self.is_processing_control_image = false;
        if self.is_any_processing() {
            warn!("Cleared processing flag while other ControlNets are still pending");
        }
        Ok(())
    }

    pub fn set_model(&mut self, id: &str, model: ControlNetModelRef) -> Result<()> {
        self.entity_mut(id)?.model = model;
        Ok(())
    }

    pub fn set_weight(&mut self, id: &str, weight: f32) -> Result<()> {
        self.entity_mut(id)?.weight = weight;
        Ok(())
    }

    pub fn set_begin_step_pct(&mut self, id: &str, begin_step_pct: f32) -> Result<()> {
        self.entity_mut(id)?.begin_step_pct = begin_step_pct;
        Ok(())
    }

    pub fn set_end_step_pct(&mut self, id: &str, end_step_pct: f32) -> Result<()> {
        self.entity_mut(id)?.end_step_pct = end_step_pct;
        Ok(())
    }

    pub fn merge_processor_params(
        &mut self,
        id: &str,
        changes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.entity_mut(id)?
            .processor_node
            .merge_params(changes)
            .with_context(|| format!("While updating processor of ControlNet {}", id))
    }

    /// Replaces the processor with the default for `processor_type`, dropping any tweaks.
    pub fn set_processor_type(&mut self, id: &str, processor_type: ProcessorType) -> Result<()> {
        self.entity_mut(id)?.processor_node = processor_type.default_node();
        Ok(())
    }

    /// Someone asked the backend to process this ControlNet's image.
    pub fn on_image_processed(&mut self, id: &str) -> Result<()> {
        let controlnet = self.entity_mut(id)?;
        if controlnet.control_image.is_some() {
            controlnet.processing = ProcessingStatus::Pending;
            self.is_processing_control_image = true;
        }
        Ok(())
    }

    pub fn enabled_controlnets(&self) -> impl Iterator<Item = &ControlNetConfig> {
        self.controlnets.values().filter(|c| c.is_enabled)
    }

    pub fn is_any_processing(&self) -> bool {
        self.controlnets
            .values()
            .any(|c| c.processing == ProcessingStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image(name: &str) -> ImageDto {
        ImageDto {
            image_name: name.to_string(),
            width: 512,
            height: 512,
        }
    }

    #[test]
    fn test_defaults() {
        let mut state = ControlNetState::new();
        assert!(!state.is_enabled);
        state.add("a", None);
        let a = state.get("a").unwrap();
        assert_eq!(a.id, "a");
        assert!(a.is_enabled);
        assert_eq!(a.weight, 1.0);
        assert_eq!(a.begin_step_pct, 0.0);
        assert_eq!(a.end_step_pct, 1.0);
        assert_eq!(a.control_image, None);
        assert!(!a.is_preprocessed);
        assert_eq!(a.model, CONTROLNET_MODELS[0]);
        assert_eq!(a.processor_node, ProcessorType::Canny.default_node());
    }

    #[test]
    fn test_add_remove_roundtrip() {
        let mut state = ControlNetState::new();
        state.add("keep", None);
        state.set_weight("keep", 0.25).unwrap();
        let before = state.clone();

        let supplied = ControlNetConfig {
            id: "ignored".to_string(),
            weight: 0.5,
            ..Default::default()
        };
        state.add("fresh", Some(supplied));
        assert_eq!(state.get("fresh").unwrap().id, "fresh");
        assert_eq!(state.get("fresh").unwrap().weight, 0.5);
        assert!(state.remove("fresh").is_some());
        assert_eq!(state, before);
    }

    #[test]
    fn test_add_overwrites() {
        let mut state = ControlNetState::new();
        state.add("a", None);
        state.set_weight("a", 0.1).unwrap();
        state.add("a", None);
        assert_eq!(state.controlnets.len(), 1);
        assert_eq!(state.get("a").unwrap().weight, 1.0);
    }

    #[test]
    fn test_remove_missing() {
        let mut state = ControlNetState::new();
        assert!(state.remove("nope").is_none());
    }

    #[test]
    fn test_missing_id_is_an_error() {
        let mut state = ControlNetState::new();
        let err = state.toggle_enabled("ghost").unwrap_err();
        assert_eq!(err.to_string(), "no such ControlNet: ghost");
        assert!(state.set_weight("ghost", 1.0).is_err());
        assert!(state.set_control_image("ghost", None).is_err());
        assert!(state.on_image_processed("ghost").is_err());
        assert!(state.duplicate("ghost").is_err());
    }

    #[test]
    fn test_duplicate() {
        let mut state = ControlNetState::new();
        state.add_from_image("a", image("cat.png"));
        state.set_weight("a", 0.7).unwrap();
        let copy = state.duplicate("a").unwrap();
        assert_ne!(copy, "a");
        let copied = state.get(&copy).unwrap();
        assert_eq!(copied.id, copy);
        assert_eq!(copied.weight, 0.7);
        assert_eq!(copied.control_image, Some(image("cat.png")));
        assert_eq!(state.controlnets.len(), 2);
    }

    #[test]
    fn test_duplicate_does_not_inherit_pending() {
        let mut state = ControlNetState::new();
        state.add("a", None);
        state.set_control_image("a", Some(image("in.png"))).unwrap();
        let copy = state.duplicate("a").unwrap();
        assert_eq!(state.get(&copy).unwrap().processing, ProcessingStatus::Idle);
        state.set_processed_image("a", Some(image("out.png"))).unwrap();
        assert!(!state.is_any_processing());

        let done = state.duplicate("a").unwrap();
        let done = state.get(&done).unwrap();
        assert_eq!(done.processing, ProcessingStatus::Done);
        assert_eq!(done.processed_control_image, Some(image("out.png")));
    }

    #[test]
    fn test_toggle_preprocessed_stops_waiting() {
        let mut state = ControlNetState::new();
        state.add_from_image("a", image("pose.png"));
        state.on_image_processed("a").unwrap();
        assert!(state.is_any_processing());
        state.toggle_preprocessed("a").unwrap();
        assert_eq!(state.get("a").unwrap().processing, ProcessingStatus::Idle);
        assert!(!state.is_any_processing());
        // Switching back leaves it idle until the image is set again.
        state.toggle_preprocessed("a").unwrap();
        assert_eq!(state.get("a").unwrap().processing, ProcessingStatus::Idle);
    }

    #[test]
    fn test_toggles() {
        let mut state = ControlNetState::new();
        state.add("a", None);
        state.toggle_enabled("a").unwrap();
        assert!(!state.get("a").unwrap().is_enabled);
        assert_eq!(state.enabled_controlnets().count(), 0);
        state.toggle_preprocessed("a").unwrap();
        assert!(state.get("a").unwrap().is_preprocessed);
        state.toggle_collection_enabled();
        assert!(state.is_enabled);
    }

    #[test]
    fn test_set_control_image_clears_processed() {
        let mut state = ControlNetState::new();
        state.add_from_image("a", image("in.png"));
        state.set_processed_image("a", Some(image("out.png"))).unwrap();
        state.set_control_image("a", Some(image("new.png"))).unwrap();
        let a = state.get("a").unwrap();
        assert_eq!(a.processed_control_image, None);
        assert_eq!(a.processing, ProcessingStatus::Pending);
        assert!(state.is_processing_control_image);

        state.set_control_image("a", None).unwrap();
        assert_eq!(state.get("a").unwrap().processed_control_image, None);
    }

    #[test]
    fn test_preprocessed_image_skips_processing() {
        let mut state = ControlNetState::new();
        state.add("a", None);
        state.toggle_preprocessed("a").unwrap();
        state.set_control_image("a", Some(image("pose.png"))).unwrap();
        assert!(!state.is_processing_control_image);
        assert_eq!(state.get("a").unwrap().processing, ProcessingStatus::Idle);
    }

    #[test_log::test]
    fn test_processed_image_clears_shared_flag() {
        let mut state = ControlNetState::new();
        state.add("a", None);
        state.add("b", None);
        state.set_control_image("a", Some(image("a.png"))).unwrap();
        state.set_control_image("b", Some(image("b.png"))).unwrap();
        state.set_processed_image("a", Some(image("a-out.png"))).unwrap();
        // The shared flag is cleared even though b is still waiting.
        assert!(!state.is_processing_control_image);
        assert!(state.is_any_processing());
        assert_eq!(state.get("a").unwrap().processing, ProcessingStatus::Done);
        assert_eq!(state.get("b").unwrap().processing, ProcessingStatus::Pending);
    }

    #[test]
    fn test_on_image_processed() {
        let mut state = ControlNetState::new();
        state.add("empty", None);
        state.on_image_processed("empty").unwrap();
        assert!(!state.is_processing_control_image);
        state.add_from_image("full", image("x.png"));
        state.on_image_processed("full").unwrap();
        assert!(state.is_processing_control_image);
    }

    #[test]
    fn test_field_setters_skip_validation() {
        let mut state = ControlNetState::new();
        state.add("a", None);
        state.set_weight("a", 5.0).unwrap();
        state.set_begin_step_pct("a", 0.9).unwrap();
        state.set_end_step_pct("a", 0.1).unwrap();
        let model = CONTROLNET_MODELS[3].clone();
        state.set_model("a", model.clone()).unwrap();
        let a = state.get("a").unwrap();
        assert_eq!(a.weight, 5.0);
        assert!(a.begin_step_pct > a.end_step_pct);
        assert_eq!(a.model, model);
    }

    #[test]
    fn test_set_processor_type_resets() {
        let mut state = ControlNetState::new();
        state.add("a", None);
        for t in ProcessorType::ALL {
            state
                .merge_processor_params("a", json!({}).as_object().unwrap())
                .unwrap();
            state.set_processor_type("a", t).unwrap();
            assert_eq!(state.get("a").unwrap().processor_node, t.default_node());
        }
        state.set_processor_type("a", ProcessorType::Canny).unwrap();
        state
            .merge_processor_params("a", json!({"high_threshold": 10}).as_object().unwrap())
            .unwrap();
        assert_ne!(state.get("a").unwrap().processor_node, ProcessorType::Canny.default_node());
        state.set_processor_type("a", ProcessorType::Canny).unwrap();
        assert_eq!(state.get("a").unwrap().processor_node, ProcessorType::Canny.default_node());
    }

    #[test]
    fn test_conditioning_image() {
        let mut config = ControlNetConfig {
            control_image: Some(image("raw.png")),
            processed_control_image: Some(image("edges.png")),
            ..Default::default()
        };
        assert_eq!(config.conditioning_image(), Some(&image("edges.png")));
        config.is_preprocessed = true;
        assert_eq!(config.conditioning_image(), Some(&image("raw.png")));
        config.is_preprocessed = false;
        config.processed_control_image = None;
        assert_eq!(config.conditioning_image(), Some(&image("raw.png")));
    }
}
