//! Narrator contract.
//!
//! Ordinary narration is streamed token by token; ending epilogues are a
//! single non-streamed completion. Either mode fails fast: the pipeline never
//! substitutes text of its own for a failed model call.

use std::pin::Pin;

use async_trait::async_trait;
use fablestep_core::step::RouteDisposition;
use futures::Stream;
use serde::{Deserialize, Serialize};

use super::model::{ModelFailure, ModelOutcome};

/// Incremental narration text.
pub type NarrationStream = Pin<Box<dyn Stream<Item = Result<String, ModelFailure>> + Send>>;

/// Prompt material for one step's narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationRequest {
    /// Story title.
    pub story_title: String,
    /// Scene the step started in.
    pub scene: String,
    /// Scene the step ended in.
    pub next_scene: String,
    /// Label of the action that executed, empty for a no-op.
    pub action_label: String,
    /// How the action was reached.
    pub disposition: RouteDisposition,
    /// Normalized player text, when the step was free text.
    pub player_input: Option<String>,
    /// Stat changes by stat id.
    pub stat_changes: Vec<(String, i64)>,
    /// Event hint, when an event fired.
    pub event_text: Option<String>,
}

/// Prompt material for an ending epilogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpilogueRequest {
    /// Story title.
    pub story_title: String,
    /// Ending title.
    pub ending_title: String,
    /// Outcome label.
    pub outcome: String,
    /// Whether the timeout policy forced the ending.
    pub forced_by_timeout: bool,
    /// Recent quest and event notes.
    pub recap: Vec<String>,
}

/// External adapter that writes prose.
#[async_trait]
pub trait Narrator: Send + Sync {
    /// Starts streaming narration for a step.
    async fn narrate(&self, request: &NarrationRequest) -> ModelOutcome<NarrationStream>;

    /// Writes an ending epilogue in one completion.
    async fn epilogue(&self, request: &EpilogueRequest) -> ModelOutcome<String>;
}
