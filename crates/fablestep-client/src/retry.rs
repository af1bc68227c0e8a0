//! Client step retry controller.
//!
//! One pending step per controller, keyed by `(session_id, fingerprint)`.
//! Network failures are retried with the same idempotency key and linear
//! backoff. When attempts run out the step becomes `uncertain`: it stays
//! pending and only a resubmission of the same payload (which reuses the
//! key) or an explicit `abandon` resolves it.

use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use fablestep_core::error::{
    INFRASTRUCTURE_ERROR, REQUEST_IN_PROGRESS, SESSION_STEP_CONFLICT, STREAM_ABORTED,
    is_terminal_code,
};
use fablestep_core::step::{StepPayload, StepResult, StepStreamEvent};
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{StepTransport, TransportError};

/// Retry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts per submission, including the first.
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `backoff_ms * n` before the next one.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 250,
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Waits between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Suspends for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// `Sleeper` backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// State of the pending step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// A submission is being attempted.
    InFlight,
    /// Attempts stopped without a known outcome.
    Uncertain,
}

/// The step the controller is responsible for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStep {
    /// Target session.
    pub session_id: Uuid,
    /// Fingerprint of `payload`.
    pub fingerprint: String,
    /// Key reused by every attempt.
    pub idempotency_key: String,
    /// The submitted payload.
    pub payload: StepPayload,
    /// Current state.
    pub status: PendingStatus,
}

/// Errors returned to the caller of the controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// A step with a different payload is still pending.
    #[error("a different step is pending for session {session_id}")]
    StepPending {
        /// Session of the pending step.
        session_id: Uuid,
    },

    /// The outcome is unknown; resubmit the same payload to resolve it.
    #[error("outcome of step {idempotency_key} is unknown: {last_error}")]
    Uncertain {
        /// Key to resolve with.
        idempotency_key: String,
        /// Failure of the last attempt.
        last_error: TransportError,
    },

    /// The server answered with an error code.
    #[error("step rejected ({code}): {message}")]
    Rejected {
        /// Wire error code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Whether a new submission may succeed.
        retryable: bool,
    },

    /// The caller stopped reading before the result arrived.
    #[error("step {idempotency_key} was cancelled before its result arrived")]
    Cancelled {
        /// Key of the cancelled step.
        idempotency_key: String,
    },

    /// `retry_pending` was called with nothing pending.
    #[error("no step is pending")]
    NothingPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Same key, next attempt.
    Retry,
    /// Give up and forget the pending step.
    Clear,
}

fn code_verdict(code: &str, server_fault: bool) -> Verdict {
    if is_terminal_code(code) || code == SESSION_STEP_CONFLICT {
        Verdict::Clear
    } else if code == REQUEST_IN_PROGRESS || server_fault {
        Verdict::Retry
    } else {
        Verdict::Clear
    }
}

fn rejected(code: &str, message: &str) -> ClientError {
    ClientError::Rejected {
        code: code.to_owned(),
        message: message.to_owned(),
        retryable: !is_terminal_code(code),
    }
}

/// Submits steps through a `StepTransport` with idempotent retries.
#[derive(Debug)]
pub struct StepRetryController<T, S = TokioSleeper> {
    transport: T,
    sleeper: S,
    config: RetryConfig,
    pending: Option<PendingStep>,
}

impl<T: StepTransport> StepRetryController<T> {
    /// Creates a controller that sleeps on the tokio timer.
    pub fn new(transport: T, config: RetryConfig) -> Self {
        Self::with_sleeper(transport, TokioSleeper, config)
    }
}

impl<T: StepTransport, S: Sleeper> StepRetryController<T, S> {
    /// Creates a controller with a custom sleeper.
    pub fn with_sleeper(transport: T, sleeper: S, config: RetryConfig) -> Self {
        Self {
            transport,
            sleeper,
            config,
            pending: None,
        }
    }

    /// The pending step, if any.
    #[must_use]
    pub fn pending(&self) -> Option<&PendingStep> {
        self.pending.as_ref()
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Forgets the pending step without resolving it.
    pub fn abandon(&mut self) -> Option<PendingStep> {
        let abandoned = self.pending.take();
        if let Some(step) = &abandoned {
            info!(idempotency_key = %step.idempotency_key, "pending step abandoned");
        }
        abandoned
    }

    /// Submits `payload` and waits for the committed result.
    ///
    /// # Errors
    ///
    /// - `ClientError::StepPending` if another payload is pending.
    /// - `ClientError::Rejected` for server error codes that end the step.
    /// - `ClientError::Uncertain` once attempts are exhausted.
    pub async fn submit(
        &mut self,
        session_id: Uuid,
        payload: StepPayload,
    ) -> Result<StepResult, ClientError> {
        let key = self.begin(session_id, &payload)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(idempotency_key = %key, attempt, "submitting step");
            match self.transport.submit_step(session_id, &key, &payload).await {
                Ok(result) => {
                    self.pending = None;
                    return Ok(result);
                }
                Err(err) => self.after_failure(&key, err, attempt).await?,
            }
        }
    }

    /// Resubmits the pending step with its original key.
    ///
    /// # Errors
    ///
    /// `ClientError::NothingPending` when no step is pending, otherwise as
    /// `submit`.
    pub async fn retry_pending(&mut self) -> Result<StepResult, ClientError> {
        let (session_id, payload) = match &self.pending {
            Some(step) => (step.session_id, step.payload.clone()),
            None => return Err(ClientError::NothingPending),
        };
        self.submit(session_id, payload).await
    }

    /// Submits `payload` on the streaming endpoint, handing every event to
    /// `on_event`. Returning `ControlFlow::Break` before `final` cancels the
    /// step and leaves it pending as uncertain.
    ///
    /// # Errors
    ///
    /// As `submit`, plus `ClientError::Cancelled` when the caller breaks.
    pub async fn submit_streaming<F>(
        &mut self,
        session_id: Uuid,
        payload: StepPayload,
        mut on_event: F,
    ) -> Result<StepResult, ClientError>
    where
        F: FnMut(&StepStreamEvent) -> ControlFlow<()>,
    {
        let key = self.begin(session_id, &payload)?;
        let mut attempt = 0;
        let mut events = loop {
            attempt += 1;
            match self.transport.stream_step(session_id, &key, &payload).await {
                Ok(events) => break events,
                Err(err) => self.after_failure(&key, err, attempt).await?,
            }
        };

        let mut result = None;
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(_) if result.is_some() => break,
                Err(err) => {
                    self.mark_uncertain();
                    return Err(ClientError::Uncertain {
                        idempotency_key: key,
                        last_error: err,
                    });
                }
            };
            if let StepStreamEvent::Final(step) = &event {
                result = Some(step.as_ref().clone());
            }
            let flow = on_event(&event);
            match &event {
                StepStreamEvent::Error { code, message } => {
                    let server_fault = code == INFRASTRUCTURE_ERROR || code == STREAM_ABORTED;
                    if code_verdict(code, server_fault) == Verdict::Clear {
                        self.pending = None;
                    } else {
                        self.mark_uncertain();
                    }
                    return Err(rejected(code, message));
                }
                StepStreamEvent::Done => break,
                _ => {}
            }
            if flow.is_break() {
                if result.is_some() {
                    break;
                }
                drop(events);
                self.mark_uncertain();
                info!(idempotency_key = %key, "step stream cancelled by caller");
                return Err(ClientError::Cancelled {
                    idempotency_key: key,
                });
            }
        }

        match result {
            Some(result) => {
                self.pending = None;
                Ok(result)
            }
            None => {
                self.mark_uncertain();
                Err(ClientError::Uncertain {
                    idempotency_key: key,
                    last_error: TransportError::Network(
                        "stream ended before the final result".into(),
                    ),
                })
            }
        }
    }

    fn begin(&mut self, session_id: Uuid, payload: &StepPayload) -> Result<String, ClientError> {
        let fingerprint = payload.fingerprint();
        match &mut self.pending {
            Some(step) if step.session_id == session_id && step.fingerprint == fingerprint => {
                step.status = PendingStatus::InFlight;
                Ok(step.idempotency_key.clone())
            }
            Some(step) => Err(ClientError::StepPending {
                session_id: step.session_id,
            }),
            None => {
                let idempotency_key = Uuid::new_v4().to_string();
                self.pending = Some(PendingStep {
                    session_id,
                    fingerprint,
                    idempotency_key: idempotency_key.clone(),
                    payload: payload.clone(),
                    status: PendingStatus::InFlight,
                });
                Ok(idempotency_key)
            }
        }
    }

    /// Decides what follows failed attempt `attempt`: `Ok` after sleeping
    /// means try again with the same key.
    async fn after_failure(
        &mut self,
        key: &str,
        err: TransportError,
        attempt: u32,
    ) -> Result<(), ClientError> {
        if let TransportError::Server { status, code, message } = &err {
            if code_verdict(code, *status >= 500) == Verdict::Clear {
                self.pending = None;
                return Err(rejected(code, message));
            }
        }
        if attempt < self.config.max_attempts {
            let delay = self.config.backoff(attempt);
            warn!(
                idempotency_key = %key,
                attempt,
                ?delay,
                error = %err,
                "step attempt failed, retrying"
            );
            self.sleeper.sleep(delay).await;
            return Ok(());
        }
        self.mark_uncertain();
        warn!(idempotency_key = %key, attempt, error = %err, "step outcome uncertain");
        Err(ClientError::Uncertain {
            idempotency_key: key.to_owned(),
            last_error: err,
        })
    }

    fn mark_uncertain(&mut self) {
        if let Some(step) = &mut self.pending {
            step.status = PendingStatus::Uncertain;
        }
    }
}
