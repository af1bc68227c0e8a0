//! Server configuration read from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fablestep_core::config::StepPolicy;
use fablestep_llm::LlmConfig;

use crate::error::AppError;

/// Everything the server needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// PostgreSQL URL; sessions are kept in memory when unset.
    pub database_url: Option<String>,
    /// Directory of published `<story_id>@<version>.yaml` packs.
    pub story_dir: PathBuf,
    /// Chat-completions endpoint settings.
    pub llm: LlmConfig,
    /// Step pipeline policy.
    pub policy: StepPolicy,
    /// OTLP collector endpoint; span export is off when unset.
    pub otlp_endpoint: Option<String>,
}

impl AppConfig {
    /// Reads the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for unparsable values or an inconsistent
    /// step policy.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// As `from_env`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut policy = StepPolicy::default();
        if let Some(high) = parse(&var, "STEP_CONFIDENCE_HIGH")? {
            policy.confidence_high = high;
        }
        if let Some(low) = parse(&var, "STEP_CONFIDENCE_LOW")? {
            policy.confidence_low = low;
        }
        if let Some(attempts) = parse(&var, "STEP_MAPPER_MAX_ATTEMPTS")? {
            policy.mapper_max_attempts = attempts;
        }
        if let Some(chars) = parse(&var, "STEP_MAX_INPUT_CHARS")? {
            policy.max_input_chars = chars;
        }
        policy
            .validate()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let mut llm = LlmConfig::new(
            var("LLM_BASE_URL").unwrap_or_else(|| "http://localhost:11434/v1".to_owned()),
            var("LLM_MODEL").unwrap_or_else(|| "llama3.1".to_owned()),
        );
        if let Some(key) = var("LLM_API_KEY") {
            llm = llm.with_api_key(key);
        }
        if let Some(secs) = parse::<u64>(&var, "LLM_TIMEOUT_SECS")? {
            llm = llm.with_timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_owned()),
            port: parse(&var, "PORT")?.unwrap_or(3000),
            database_url: var("DATABASE_URL"),
            story_dir: var("STORY_DIR").map_or_else(|| PathBuf::from("stories"), PathBuf::from),
            llm,
            policy,
            otlp_endpoint: var("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    /// The address to bind.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if host and port do not form an address.
    pub fn socket_addr(&self) -> Result<SocketAddr, AppError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AppError::Config(format!("invalid HOST:PORT combination: {e}")))
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| AppError::Config(format!("{name} is invalid: {e}")))
        })
        .transpose()
}
