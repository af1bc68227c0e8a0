//! Adapter configuration.

use std::time::Duration;

/// Connection settings for a chat-completions endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    /// Base URL up to and including the API version, e.g.
    /// `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer token; omitted for local servers that need none.
    pub api_key: Option<String>,
    /// Model name sent with every request.
    pub model: String,
    /// Whole-request timeout. Streams are bounded by it too.
    pub timeout: Duration,
    /// Completion length limit for narration.
    pub max_tokens: u32,
}

impl LlmConfig {
    /// Creates a configuration with default timeout and length limits.
    #[must_use]
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            timeout: Duration::from_secs(60),
            max_tokens: 400,
        }
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}
