//! Shared application state.

use fablestep_session::application::runtime::StepRuntime;

/// Application state shared across all request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Collaborators of the step pipeline; also used by the session routes.
    pub runtime: StepRuntime,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(runtime: StepRuntime) -> Self {
        Self { runtime }
    }
}
