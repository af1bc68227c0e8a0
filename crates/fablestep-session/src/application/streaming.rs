//! Streaming step executor.
//!
//! The pipeline runs on its own task and pushes typed events into a bounded
//! channel. A single consumer reads them in order and may cancel at any time
//! by dropping its end. Cancellation before `final` leaves the session
//! untouched and marks the key `failed` with `STREAM_ABORTED`.
//!
//! Event order: `meta`, then `phase` and `narrative_delta` events, an
//! optional `replay`, exactly one of `final` or `error`, then `done`.

use async_trait::async_trait;
use fablestep_core::error::DomainError;
use fablestep_core::step::{StepPhase, StepStreamEvent};
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, info_span, warn};

use crate::application::pipeline::{StepObserver, submit};
use crate::application::runtime::StepRuntime;
use crate::domain::commands::SubmitStep;

/// Forwards pipeline progress into the event channel.
struct ChannelObserver {
    tx: mpsc::Sender<StepStreamEvent>,
    final_slot: Option<OwnedPermit<StepStreamEvent>>,
}

impl ChannelObserver {
    async fn send(&self, event: StepStreamEvent) -> Result<(), DomainError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| DomainError::StreamAborted)
    }
}

#[async_trait]
impl StepObserver for ChannelObserver {
    async fn phase(&mut self, phase: StepPhase) -> Result<(), DomainError> {
        self.send(StepStreamEvent::Phase { phase }).await
    }

    async fn delta(&mut self, text: String) -> Result<(), DomainError> {
        self.send(StepStreamEvent::NarrativeDelta { text }).await
    }

    async fn cancelled(&self) {
        self.tx.closed().await;
    }

    // Reserving the slot for `final` before committing means a commit is only
    // attempted while the consumer is still there to receive it.
    async fn before_commit(&mut self) -> Result<(), DomainError> {
        let permit = self
            .tx
            .clone()
            .reserve_owned()
            .await
            .map_err(|_| DomainError::StreamAborted)?;
        self.final_slot = Some(permit);
        Ok(())
    }
}

/// A running streamed step.
#[derive(Debug)]
pub struct StepStream {
    events: mpsc::Receiver<StepStreamEvent>,
    task: JoinHandle<()>,
}

impl StepStream {
    /// Next event, or `None` after `done`.
    pub async fn next(&mut self) -> Option<StepStreamEvent> {
        self.events.recv().await
    }

    /// Stops consuming and waits for the producer to wind down.
    pub async fn cancel(self) {
        drop(self.events);
        if let Err(err) = self.task.await {
            warn!(%err, "step stream task failed");
        }
    }

    /// Converts into a `Stream` of events. Dropping the stream cancels.
    #[must_use]
    pub fn into_stream(self) -> ReceiverStream<StepStreamEvent> {
        ReceiverStream::new(self.events)
    }
}

/// Spawns the pipeline for `command` and returns its event stream.
#[must_use]
pub fn spawn_step_stream(runtime: StepRuntime, command: SubmitStep) -> StepStream {
    let (tx, events) = mpsc::channel(runtime.policy.stream_buffer.max(1));
    let span = info_span!(
        "step_stream",
        correlation_id = %command.correlation_id,
        session_id = %command.session_id,
        idempotency_key = %command.idempotency_key,
    );
    let task = tokio::spawn(run_stream(runtime, command, tx).instrument(span));
    StepStream { events, task }
}

async fn run_stream(runtime: StepRuntime, command: SubmitStep, tx: mpsc::Sender<StepStreamEvent>) {
    let meta = StepStreamEvent::Meta {
        idempotency_key: command.idempotency_key.clone(),
        session_id: command.session_id,
    };
    if tx.send(meta).await.is_err() {
        debug!("consumer left before the step started");
        return;
    }

    let mut observer = ChannelObserver {
        tx: tx.clone(),
        final_slot: None,
    };
    let outcome = submit(&command, &runtime, &mut observer).await;
    let final_slot = observer.final_slot.take();
    drop(observer);

    let terminal = match outcome {
        Ok(outcome) => {
            let step_index = outcome.result.step_index;
            let event = StepStreamEvent::Final(Box::new(outcome.result));
            if outcome.replayed {
                let replay = StepStreamEvent::Replay {
                    idempotency_key: command.idempotency_key.clone(),
                };
                if tx.send(replay).await.is_err() {
                    return;
                }
            }
            match final_slot {
                Some(permit) => {
                    if tx.is_closed() {
                        warn!(
                            session_id = %command.session_id,
                            step_index,
                            idempotency_key = %command.idempotency_key,
                            "consumer left while the step committed; final not delivered"
                        );
                    }
                    drop(permit.send(event));
                    Ok(())
                }
                None => tx.send(event).await,
            }
        }
        Err(DomainError::StreamAborted) => return,
        Err(err) => tx.send(StepStreamEvent::from_error(&err)).await,
    };
    if terminal.is_ok() {
        // The consumer may already be gone; `done` is best effort.
        let _ = tx.send(StepStreamEvent::Done).await;
    }
}
