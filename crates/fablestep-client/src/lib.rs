//! Fablestep client: submits steps on behalf of a player.
//!
//! The retry controller owns at most one pending step, reuses its idempotency
//! key across retries, and reports an unknown outcome as `uncertain` instead
//! of guessing. `HttpStepTransport` speaks the server's JSON and SSE surface.

pub mod http;
pub mod retry;
mod sse;
pub mod transport;

pub use http::{HttpStepTransport, IDEMPOTENCY_KEY_HEADER};
pub use retry::{
    ClientError, PendingStatus, PendingStep, RetryConfig, Sleeper, StepRetryController,
    TokioSleeper,
};
pub use transport::{StepEventStream, StepTransport, TransportError};
