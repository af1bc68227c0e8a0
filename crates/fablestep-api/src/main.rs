//! Fablestep API server entry point.

use std::sync::Arc;

use fablestep_api::config::AppConfig;
use fablestep_api::error::AppError;
use fablestep_api::state::AppState;
use fablestep_api::telemetry;
use fablestep_core::clock::SystemClock;
use fablestep_core::repository::SessionRepository;
use fablestep_llm::ChatCompletionsClient;
use fablestep_session::application::runtime::StepRuntime;
use fablestep_store::MIGRATOR;
use fablestep_store::memory::InMemorySessionRepository;
use fablestep_store::pg_session_repository::PgSessionRepository;
use fablestep_story::catalog::DirectoryCatalog;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = AppConfig::from_env()?;
    let tracer_provider = telemetry::init(config.otlp_endpoint.as_deref())?;

    info!("Starting Fablestep API server");

    let repo: Arc<dyn SessionRepository> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await?;
            MIGRATOR.run(&pool).await?;
            Arc::new(PgSessionRepository::new(pool))
        }
        None => {
            warn!("DATABASE_URL is not set; sessions are kept in memory and lost on restart");
            Arc::new(InMemorySessionRepository::new())
        }
    };

    let model = Arc::new(ChatCompletionsClient::new(config.llm.clone())?);
    let runtime = StepRuntime {
        repo,
        catalog: Arc::new(DirectoryCatalog::new(config.story_dir.clone())),
        mapper: model.clone(),
        narrator: model,
        clock: Arc::new(SystemClock),
        policy: config.policy.clone(),
    };
    let app = fablestep_api::app(AppState::new(runtime));

    let addr = config.socket_addr()?;
    info!(%addr, story_dir = %config.story_dir.display(), "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(provider) = tracer_provider {
        if let Err(err) = provider.shutdown() {
            warn!(%err, "failed to flush spans");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
