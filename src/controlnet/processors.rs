// ControlNet image processors.
//
// Every processor type has exactly one registered default configuration. Switching an
// entity's processor type always goes back to that default; tweaking parameters goes
// through merge_params instead.

use std::{fmt, str::FromStr};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Keys a parameter patch may never touch. They identify the node, not configure it.
const RESERVED_KEYS: &[&str] = &["id", "type", "is_intermediate"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessorType {
    #[serde(rename = "canny_image_processor")]
    Canny,
    #[serde(rename = "content_shuffle_image_processor")]
    ContentShuffle,
    #[serde(rename = "hed_image_processor")]
    Hed,
    #[serde(rename = "lineart_anime_image_processor")]
    LineartAnime,
    #[serde(rename = "lineart_image_processor")]
    Lineart,
    #[serde(rename = "mediapipe_face_processor")]
    MediapipeFace,
    #[serde(rename = "midas_depth_image_processor")]
    MidasDepth,
    #[serde(rename = "mlsd_image_processor")]
    Mlsd,
    #[serde(rename = "normalbae_image_processor")]
    NormalBae,
    #[serde(rename = "openpose_image_processor")]
    Openpose,
    #[serde(rename = "pidi_image_processor")]
    Pidi,
    #[serde(rename = "zoe_depth_image_processor")]
    ZoeDepth,
}

impl ProcessorType {
    pub const ALL: [ProcessorType; 12] = [
        ProcessorType::Canny,
        ProcessorType::ContentShuffle,
        ProcessorType::Hed,
        ProcessorType::LineartAnime,
        ProcessorType::Lineart,
        ProcessorType::MediapipeFace,
        ProcessorType::MidasDepth,
        ProcessorType::Mlsd,
        ProcessorType::NormalBae,
        ProcessorType::Openpose,
        ProcessorType::Pidi,
        ProcessorType::ZoeDepth,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProcessorType::Canny => "canny_image_processor",
            ProcessorType::ContentShuffle => "content_shuffle_image_processor",
            ProcessorType::Hed => "hed_image_processor",
            ProcessorType::LineartAnime => "lineart_anime_image_processor",
            ProcessorType::Lineart => "lineart_image_processor",
            ProcessorType::MediapipeFace => "mediapipe_face_processor",
            ProcessorType::MidasDepth => "midas_depth_image_processor",
            ProcessorType::Mlsd => "mlsd_image_processor",
            ProcessorType::NormalBae => "normalbae_image_processor",
            ProcessorType::Openpose => "openpose_image_processor",
            ProcessorType::Pidi => "pidi_image_processor",
            ProcessorType::ZoeDepth => "zoe_depth_image_processor",
        }
    }

    /// The registered default node for this processor type.
    pub fn default_node(self) -> ProcessorNode {
        let params = match self {
            ProcessorType::Canny => ProcessorParams::Canny {
                low_threshold: 100,
                high_threshold: 200,
            },
            ProcessorType::ContentShuffle => ProcessorParams::ContentShuffle {
                detect_resolution: 512,
                image_resolution: 512,
                h: 512,
                w: 512,
                f: 256,
            },
            ProcessorType::Hed => ProcessorParams::Hed {
                detect_resolution: 512,
                image_resolution: 512,
                scribble: false,
            },
            ProcessorType::LineartAnime => ProcessorParams::LineartAnime {
                detect_resolution: 512,
                image_resolution: 512,
            },
            ProcessorType::Lineart => ProcessorParams::Lineart {
                detect_resolution: 512,
                image_resolution: 512,
                coarse: false,
            },
            ProcessorType::MediapipeFace => ProcessorParams::MediapipeFace {
                max_faces: 1,
                min_confidence: 0.5,
            },
            ProcessorType::MidasDepth => ProcessorParams::MidasDepth {
                a_mult: 2.0,
                bg_th: 0.1,
            },
            ProcessorType::Mlsd => ProcessorParams::Mlsd {
                detect_resolution: 512,
                image_resolution: 512,
                thr_d: 0.1,
                thr_v: 0.1,
            },
            ProcessorType::NormalBae => ProcessorParams::NormalBae {
                detect_resolution: 512,
                image_resolution: 512,
            },
            ProcessorType::Openpose => ProcessorParams::Openpose {
                detect_resolution: 512,
                image_resolution: 512,
                hand_and_face: false,
            },
            ProcessorType::Pidi => ProcessorParams::Pidi {
                detect_resolution: 512,
                image_resolution: 512,
                safe: false,
                scribble: false,
            },
            ProcessorType::ZoeDepth => ProcessorParams::ZoeDepth {},
        };
        ProcessorNode {
            id: self.name().to_string(),
            params,
        }
    }
}

impl fmt::Display for ProcessorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProcessorType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(found) = ProcessorType::ALL.iter().find(|t| t.name() == s) {
            return Ok(*found);
        }
        // Nothing matched exactly, so suggest the closest one.
        let closest = ProcessorType::ALL
            .iter()
            .min_by_key(|t| strsim::levenshtein(s, t.name()))
            .map(|t| t.name())
            .unwrap_or_default();
        bail!("Unknown processor type: {}. Did you mean {}?", s, closest)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProcessorParams {
    #[serde(rename = "canny_image_processor")]
    Canny { low_threshold: u32, high_threshold: u32 },
    #[serde(rename = "content_shuffle_image_processor")]
    ContentShuffle {
        detect_resolution: u32,
        image_resolution: u32,
        h: u32,
        w: u32,
        f: u32,
    },
    #[serde(rename = "hed_image_processor")]
    Hed {
        detect_resolution: u32,
        image_resolution: u32,
        scribble: bool,
    },
    #[serde(rename = "lineart_anime_image_processor")]
    LineartAnime {
        detect_resolution: u32,
        image_resolution: u32,
    },
    #[serde(rename = "lineart_image_processor")]
    Lineart {
        detect_resolution: u32,
        image_resolution: u32,
        coarse: bool,
    },
    #[serde(rename = "mediapipe_face_processor")]
    MediapipeFace { max_faces: u32, min_confidence: f32 },
    #[serde(rename = "midas_depth_image_processor")]
    MidasDepth { a_mult: f32, bg_th: f32 },
    #[serde(rename = "mlsd_image_processor")]
    Mlsd {
        detect_resolution: u32,
        image_resolution: u32,
        thr_d: f32,
        thr_v: f32,
    },
    #[serde(rename = "normalbae_image_processor")]
    NormalBae {
        detect_resolution: u32,
        image_resolution: u32,
    },
    #[serde(rename = "openpose_image_processor")]
    Openpose {
        detect_resolution: u32,
        image_resolution: u32,
        hand_and_face: bool,
    },
    #[serde(rename = "pidi_image_processor")]
    Pidi {
        detect_resolution: u32,
        image_resolution: u32,
        safe: bool,
        scribble: bool,
    },
    #[serde(rename = "zoe_depth_image_processor")]
    ZoeDepth {},
}

impl ProcessorParams {
    pub fn processor_type(&self) -> ProcessorType {
        match self {
            ProcessorParams::Canny { .. } => ProcessorType::Canny,
            ProcessorParams::ContentShuffle { .. } => ProcessorType::ContentShuffle,
            ProcessorParams::Hed { .. } => ProcessorType::Hed,
            ProcessorParams::LineartAnime { .. } => ProcessorType::LineartAnime,
            ProcessorParams::Lineart { .. } => ProcessorType::Lineart,
            ProcessorParams::MediapipeFace { .. } => ProcessorType::MediapipeFace,
            ProcessorParams::MidasDepth { .. } => ProcessorType::MidasDepth,
            ProcessorParams::Mlsd { .. } => ProcessorType::Mlsd,
            ProcessorParams::NormalBae { .. } => ProcessorType::NormalBae,
            ProcessorParams::Openpose { .. } => ProcessorType::Openpose,
            ProcessorParams::Pidi { .. } => ProcessorType::Pidi,
            ProcessorParams::ZoeDepth {} => ProcessorType::ZoeDepth,
        }
    }
}

/// A processor as attached to a ControlNet: its node id plus typed parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessorNode {
    pub id: String,
    #[serde(flatten)]
    pub params: ProcessorParams,
}

impl ProcessorNode {
    pub fn processor_type(&self) -> ProcessorType {
        self.params.processor_type()
    }

    /// Shallow-merges `changes` into the parameters.
    /// Identity keys and parameters this processor doesn't have are rejected, and so are
    /// values of the wrong type. On error the node is left as it was.
    pub fn merge_params(&mut self, changes: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let mut current = match serde_json::to_value(&self.params).context("failed to serialize processor params")? {
            serde_json::Value::Object(map) => map,
            other => bail!("processor params serialized to a non-object: {}", other),
        };
        for (key, value) in changes {
            if RESERVED_KEYS.contains(&key.as_str()) {
                bail!("Cannot change '{}' of processor {}", key, self.id);
            }
            if !current.contains_key(key) {
                bail!("Processor {} has no parameter '{}'", self.processor_type(), key);
            }
            current.insert(key.clone(), value.clone());
        }
        let merged: ProcessorParams = serde_json::from_value(serde_json::Value::Object(current))
            .with_context(|| format!("Invalid parameters for processor {}", self.processor_type()))?;
        self.params = merged;
        Ok(())
    }
}

impl Default for ProcessorNode {
    fn default() -> Self {
        ProcessorType::Canny.default_node()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn changes(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_default_ids_match_types() {
        for t in ProcessorType::ALL {
            let node = t.default_node();
            assert_eq!(node.id, t.name());
            assert_eq!(node.processor_type(), t);
        }
    }

    #[test]
    fn test_serialized_shape() {
        let node = ProcessorType::Canny.default_node();
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "canny_image_processor",
                "type": "canny_image_processor",
                "low_threshold": 100,
                "high_threshold": 200,
            })
        );
        let back: ProcessorNode = serde_json::from_value(value).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_parse_suggests() {
        assert_eq!("hed_image_processor".parse::<ProcessorType>().unwrap(), ProcessorType::Hed);
        let err = "cany_image_processor".parse::<ProcessorType>().unwrap_err();
        assert!(err.to_string().contains("Did you mean canny_image_processor"), "{}", err);
    }

    #[test]
    fn test_merge_params() {
        let mut node = ProcessorType::Canny.default_node();
        node.merge_params(&changes(json!({"low_threshold": 50}))).unwrap();
        assert_eq!(
            node.params,
            ProcessorParams::Canny {
                low_threshold: 50,
                high_threshold: 200
            }
        );
    }

    #[test]
    fn test_merge_rejects_identity_keys() {
        let mut node = ProcessorType::Canny.default_node();
        let original = node.clone();
        assert!(node.merge_params(&changes(json!({"type": "hed_image_processor"}))).is_err());
        assert!(node.merge_params(&changes(json!({"id": "other"}))).is_err());
        assert!(node.merge_params(&changes(json!({"is_intermediate": false}))).is_err());
        assert_eq!(node, original);
    }

    #[test]
    fn test_merge_rejects_unknown_and_mistyped() {
        let mut node = ProcessorType::Openpose.default_node();
        let original = node.clone();
        assert!(node.merge_params(&changes(json!({"low_threshold": 1}))).is_err());
        assert!(node.merge_params(&changes(json!({"hand_and_face": "yes"}))).is_err());
        // A partially valid patch doesn't apply half of itself.
        assert!(node
            .merge_params(&changes(json!({"detect_resolution": 256, "bogus": 1})))
            .is_err());
        assert_eq!(node, original);
    }
}
