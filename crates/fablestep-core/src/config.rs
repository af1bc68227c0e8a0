//! Step policy configuration.
//!
//! Thresholds and bounds used by the step pipeline are policy data rather than
//! protocol, so they are injected here with their documented defaults.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Policy numbers consumed by the step pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepPolicy {
    /// Mapped free text at or above this confidence executes its target.
    pub confidence_high: f64,
    /// Mapped free text below this confidence is treated as "no match".
    pub confidence_low: f64,
    /// Intent mapping attempts before the step fails with `MODEL_UNAVAILABLE`.
    pub mapper_max_attempts: u32,
    /// Maximum accepted free-text length in characters, after normalization.
    pub max_input_chars: usize,
    /// Capacity of the quest recent-event ring buffer.
    pub recent_events_cap: usize,
    /// NPC hot-memory entries kept before compaction to cold references.
    pub npc_hot_memory_limit: usize,
    /// Tier penalty added to the mapper tier on fallback paths.
    pub fallback_base_penalty: i8,
    /// Capacity of the per-step stream channel.
    pub stream_buffer: usize,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            confidence_high: 0.8,
            confidence_low: 0.4,
            mapper_max_attempts: 3,
            max_input_chars: 500,
            recent_events_cap: 20,
            npc_hot_memory_limit: 8,
            fallback_base_penalty: -1,
            stream_buffer: 16,
        }
    }
}

impl StepPolicy {
    /// Checks internal consistency of the policy.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if a threshold is out of range, the
    /// thresholds are inverted, or a bound is zero.
    pub fn validate(&self) -> Result<(), DomainError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.confidence_high) || !in_unit(self.confidence_low) {
            return Err(DomainError::Validation(
                "confidence thresholds must lie in [0, 1]".to_owned(),
            ));
        }
        if self.confidence_low > self.confidence_high {
            return Err(DomainError::Validation(format!(
                "confidence_low {} exceeds confidence_high {}",
                self.confidence_low, self.confidence_high
            )));
        }
        if self.mapper_max_attempts == 0 {
            return Err(DomainError::Validation(
                "mapper_max_attempts must be at least 1".to_owned(),
            ));
        }
        if self.max_input_chars == 0
            || self.recent_events_cap == 0
            || self.npc_hot_memory_limit == 0
            || self.stream_buffer == 0
        {
            return Err(DomainError::Validation(
                "input, ring buffer, memory and stream bounds must be non-zero".to_owned(),
            ));
        }
        if !(-2..=2).contains(&self.fallback_base_penalty) {
            return Err(DomainError::Validation(
                "fallback_base_penalty must be a tier in [-2, 2]".to_owned(),
            ));
        }
        Ok(())
    }
}
