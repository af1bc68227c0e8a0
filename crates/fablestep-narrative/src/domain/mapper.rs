//! Intent mapper contract.

use async_trait::async_trait;
use fablestep_story::domain::pack::{Node, StoryPack};
use serde::{Deserialize, Serialize};

use super::model::ModelOutcome;

/// Kind of target a mapping names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappedTargetType {
    /// A visible choice of the node.
    Choice,
    /// A mapping-only intent of the node.
    Intent,
}

/// One entry of the allow-list sent to the mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedTarget {
    /// Target kind.
    pub target_type: MappedTargetType,
    /// Target id.
    pub target_id: String,
    /// Label or description shown to the mapper.
    pub hint: String,
}

/// A mapping request for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRequest {
    /// Story the node belongs to.
    pub story_id: String,
    /// Current node.
    pub node_id: String,
    /// Scene title and description.
    pub scene: String,
    /// Normalized player text.
    pub player_input: String,
    /// Targets the mapping may name.
    pub allow_list: Vec<AllowedTarget>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Failure code of the previous attempt.
    pub previous_error: Option<String>,
}

/// Structured mapping output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentMapping {
    /// Target kind.
    pub target_type: MappedTargetType,
    /// Target id.
    pub target_id: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Intensity tier in `[-2, 2]`.
    #[serde(default)]
    pub intensity_tier: i8,
    /// Whether the model flagged the input.
    #[serde(default)]
    pub policy_flagged: bool,
}

impl IntentMapping {
    /// Whether the mapping names an entry of `allow_list`.
    #[must_use]
    pub fn is_allowed(&self, allow_list: &[AllowedTarget]) -> bool {
        allow_list
            .iter()
            .any(|t| t.target_type == self.target_type && t.target_id == self.target_id)
    }

    /// Whether confidence and tier are in range.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
            && (-2..=2).contains(&self.intensity_tier)
    }
}

/// External adapter that maps free text to a target of the current node.
#[async_trait]
pub trait IntentMapper: Send + Sync {
    /// Maps one request.
    async fn map_intent(&self, request: &MappingRequest) -> ModelOutcome<IntentMapping>;
}

/// Allow-list for `node`: its visible choices and its intents.
#[must_use]
pub fn allow_list(node: &Node) -> Vec<AllowedTarget> {
    node.choices
        .iter()
        .map(|choice| AllowedTarget {
            target_type: MappedTargetType::Choice,
            target_id: choice.id.clone(),
            hint: choice.label.clone(),
        })
        .chain(node.intents.iter().map(|intent| AllowedTarget {
            target_type: MappedTargetType::Intent,
            target_id: intent.id.clone(),
            hint: intent.description.clone(),
        }))
        .collect()
}

/// Scene text for prompts.
#[must_use]
pub fn scene_text(pack: &StoryPack, node: &Node) -> String {
    match (node.title.is_empty(), node.description.is_empty()) {
        (true, true) => pack.title.clone(),
        (false, true) => node.title.clone(),
        (true, false) => node.description.clone(),
        (false, false) => format!("{}. {}", node.title, node.description),
    }
}
