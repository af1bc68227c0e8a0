//! Scripted model adapters: deterministic `IntentMapper` and `Narrator`
//! implementations for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use fablestep_narrative::domain::mapper::{
    IntentMapper, IntentMapping, MappedTargetType, MappingRequest,
};
use fablestep_narrative::domain::model::{
    ModelFailure, ModelOutcome, TRANSPORT_ERROR, UPSTREAM_REJECTED,
};
use fablestep_narrative::domain::narrator::{
    EpilogueRequest, NarrationRequest, NarrationStream, Narrator,
};
use futures::StreamExt;

#[derive(Debug, Clone)]
enum Scripted {
    Map(IntentMapping),
    Retryable(ModelFailure),
    Fatal(ModelFailure),
}

impl Scripted {
    fn outcome(self) -> ModelOutcome<IntentMapping> {
        match self {
            Self::Map(mapping) => ModelOutcome::Ok(mapping),
            Self::Retryable(failure) => ModelOutcome::RetryableFailure(failure),
            Self::Fatal(failure) => ModelOutcome::FatalFailure(failure),
        }
    }
}

/// An intent mapper that replays a script. The last entry repeats once the
/// script runs out.
#[derive(Debug)]
pub struct ScriptedMapper {
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
}

impl ScriptedMapper {
    fn from_script(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always maps to `target_id` with tier 0.
    #[must_use]
    pub fn mapping(target_type: MappedTargetType, target_id: &str, confidence: f64) -> Self {
        Self::with_tier(target_type, target_id, confidence, 0)
    }

    /// Always maps to `target_id` with the given tier.
    #[must_use]
    pub fn with_tier(
        target_type: MappedTargetType,
        target_id: &str,
        confidence: f64,
        intensity_tier: i8,
    ) -> Self {
        Self::from_script(vec![Scripted::Map(IntentMapping {
            target_type,
            target_id: target_id.to_owned(),
            confidence,
            intensity_tier,
            policy_flagged: false,
        })])
    }

    /// Always fails with a retryable transport error.
    #[must_use]
    pub fn unavailable() -> Self {
        Self::from_script(vec![Scripted::Retryable(ModelFailure::new(
            TRANSPORT_ERROR,
            "connection reset",
        ))])
    }

    /// Always fails fatally.
    #[must_use]
    pub fn rejected() -> Self {
        Self::from_script(vec![Scripted::Fatal(ModelFailure::new(
            UPSTREAM_REJECTED,
            "401 unauthorized",
        ))])
    }

    /// Fails with retryable transport errors `failures` times, then maps.
    #[must_use]
    pub fn flaky(
        failures: usize,
        target_type: MappedTargetType,
        target_id: &str,
        confidence: f64,
    ) -> Self {
        let mut script: Vec<Scripted> = (0..failures)
            .map(|i| {
                Scripted::Retryable(ModelFailure::new(TRANSPORT_ERROR, format!("attempt {i}")))
            })
            .collect();
        script.push(Scripted::Map(IntentMapping {
            target_type,
            target_id: target_id.to_owned(),
            confidence,
            intensity_tier: 0,
            policy_flagged: false,
        }));
        Self::from_script(script)
    }

    /// Number of `map_intent` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntentMapper for ScriptedMapper {
    async fn map_intent(&self, _request: &MappingRequest) -> ModelOutcome<IntentMapping> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        next.map_or_else(
            || ModelOutcome::FatalFailure(ModelFailure::new(UPSTREAM_REJECTED, "empty script")),
            Scripted::outcome,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Complete,
    Stall,
    Fail,
}

/// A narrator that streams fixed chunks.
#[derive(Debug)]
pub struct ScriptedNarrator {
    chunks: Vec<String>,
    end: StreamEnd,
    refuse: bool,
    epilogue: Result<String, ModelFailure>,
    calls: AtomicUsize,
}

impl ScriptedNarrator {
    /// Streams `chunks` and completes.
    #[must_use]
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| (*c).to_owned()).collect(),
            end: StreamEnd::Complete,
            refuse: false,
            epilogue: Ok("And so the night ends.".to_owned()),
            calls: AtomicUsize::new(0),
        }
    }

    /// After the chunks, the stream never yields again.
    #[must_use]
    pub fn stalling(mut self) -> Self {
        self.end = StreamEnd::Stall;
        self
    }

    /// After the chunks, the stream yields a transport error.
    #[must_use]
    pub fn failing_mid_stream(mut self) -> Self {
        self.end = StreamEnd::Fail;
        self
    }

    /// `narrate` fails before streaming anything.
    #[must_use]
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// `epilogue` fails fatally.
    #[must_use]
    pub fn failing_epilogue(mut self) -> Self {
        self.epilogue = Err(ModelFailure::new(UPSTREAM_REJECTED, "epilogue refused"));
        self
    }

    /// Number of `narrate` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Narrator for ScriptedNarrator {
    async fn narrate(&self, _request: &NarrationRequest) -> ModelOutcome<NarrationStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return ModelOutcome::FatalFailure(ModelFailure::new(UPSTREAM_REJECTED, "refused"));
        }
        let chunks = futures::stream::iter(self.chunks.clone().into_iter().map(Ok));
        let stream: NarrationStream = match self.end {
            StreamEnd::Complete => Box::pin(chunks),
            StreamEnd::Stall => Box::pin(chunks.chain(futures::stream::pending())),
            StreamEnd::Fail => Box::pin(chunks.chain(futures::stream::once(async {
                Err(ModelFailure::new(TRANSPORT_ERROR, "stream reset"))
            }))),
        };
        ModelOutcome::Ok(stream)
    }

    async fn epilogue(&self, _request: &EpilogueRequest) -> ModelOutcome<String> {
        match &self.epilogue {
            Ok(text) => ModelOutcome::Ok(text.clone()),
            Err(failure) => ModelOutcome::FatalFailure(failure.clone()),
        }
    }
}
