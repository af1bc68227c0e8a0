//! Collaborators a step needs, bundled for handlers and spawned streams.

use std::fmt;
use std::sync::Arc;

use fablestep_core::clock::Clock;
use fablestep_core::config::StepPolicy;
use fablestep_core::repository::SessionRepository;
use fablestep_narrative::domain::mapper::IntentMapper;
use fablestep_narrative::domain::narrator::Narrator;
use fablestep_story::catalog::StoryCatalog;

/// Shared step runtime. Cheap to clone.
#[derive(Clone)]
pub struct StepRuntime {
    /// Session store.
    pub repo: Arc<dyn SessionRepository>,
    /// Published story packs.
    pub catalog: Arc<dyn StoryCatalog>,
    /// Free-text intent mapper.
    pub mapper: Arc<dyn IntentMapper>,
    /// Prose generator.
    pub narrator: Arc<dyn Narrator>,
    /// Time source for record timestamps.
    pub clock: Arc<dyn Clock>,
    /// Policy numbers.
    pub policy: StepPolicy,
}

impl fmt::Debug for StepRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRuntime")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
