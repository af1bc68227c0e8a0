//! Fablestep LLM: HTTP adapters for the language model contracts.
//!
//! `ChatCompletionsClient` talks to any OpenAI-compatible
//! `/chat/completions` endpoint and implements both `IntentMapper` (one JSON
//! completion per attempt) and `Narrator` (SSE token streaming for narration,
//! a single completion for epilogues). Every failure is classified as
//! retryable or fatal; nothing is raised.

pub mod client;
pub mod config;
mod prompt;
mod sse;

pub use client::{ChatCompletionsClient, LlmError};
pub use config::LlmConfig;
