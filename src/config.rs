// This module handles session files.
// A session file describes one generation request: the pipeline variant, the generation
// settings, and the ControlNet actions the user took, in order. Replaying those actions
// through the store gives the ControlNet state the graph is built from.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    controlnet::{ControlNetAction, ControlNetState},
    generation::GenerationSettings,
    graph::GraphVariant,
};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub variant: GraphVariant,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub controlnet: ControlNetSection,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ControlNetSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub actions: Vec<ControlNetAction>,
}

pub fn read_config(path: impl AsRef<Path>) -> Result<SessionConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Error reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Error parsing {}", path.display()))
}

impl SessionConfig {
    /// Replays the recorded actions into a fresh store.
    pub fn controlnet_state(&self) -> Result<ControlNetState> {
        let mut state = ControlNetState::new();
        state.is_enabled = self.controlnet.enabled;
        state
            .reduce_all(self.controlnet.actions.iter().cloned())
            .context("Error replaying ControlNet actions")?;
        Ok(state)
    }
}

#[cfg(test)]
pub fn testconfig() -> SessionConfig {
    toml::from_str(include_str!("../testdata/session.toml")).unwrap()
}
