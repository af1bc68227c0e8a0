//! Input policy gate.
//!
//! Free text is screened before any model call. Rejected text never reaches
//! the mapper; the selector routes it straight to a fallback executor.

use serde::Serialize;

/// Phrases that indicate an attempt to steer the model or extract its
/// instructions. Matched against lowercased, whitespace-normalized text.
const INJECTION_PATTERNS: &[&str] = &[
    "ignore previous instructions",
    "ignore all previous",
    "ignore the above",
    "disregard previous",
    "disregard the above",
    "forget your instructions",
    "system prompt",
    "reveal your instructions",
    "print your instructions",
    "developer mode",
    "you are now",
    "act as the system",
    "<|",
    "|>",
    "[[",
    "]]",
    "{{",
    "}}",
    "```",
];

/// Why text was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Longer than the configured limit after normalization.
    TooLong { chars: usize, max: usize },
    /// Contains non-whitespace control characters.
    ControlCharacters,
    /// Matches an injection or system-leak pattern.
    InjectionPattern { pattern: String },
}

/// Classification of raw player text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    /// Safe to send to the mapper.
    Accepted { normalized: String },
    /// Nothing but whitespace; treated as no input.
    Empty,
    /// Unsafe; routed to the `input_rejected` fallback.
    Rejected(RejectReason),
}

/// Normalizes and screens free text.
#[derive(Debug, Clone, Copy)]
pub struct InputPolicyGate {
    max_chars: usize,
}

impl InputPolicyGate {
    /// Creates a gate accepting at most `max_chars` characters.
    #[must_use]
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// Classifies `raw`.
    #[must_use]
    pub fn screen(&self, raw: &str) -> GateVerdict {
        if raw.chars().any(|c| c.is_control() && !c.is_whitespace()) {
            return GateVerdict::Rejected(RejectReason::ControlCharacters);
        }

        let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            return GateVerdict::Empty;
        }

        let chars = normalized.chars().count();
        if chars > self.max_chars {
            return GateVerdict::Rejected(RejectReason::TooLong {
                chars,
                max: self.max_chars,
            });
        }

        let lowered = normalized.to_lowercase();
        if let Some(pattern) = INJECTION_PATTERNS.iter().find(|p| lowered.contains(*p)) {
            return GateVerdict::Rejected(RejectReason::InjectionPattern {
                pattern: (*pattern).to_owned(),
            });
        }

        GateVerdict::Accepted { normalized }
    }
}
