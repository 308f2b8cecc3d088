//! HTTP API for playbooks and learn jobs

pub mod http;

use anyhow::{Context, Result};
use axum::{
    routing::{get, patch, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::learning::{
    CurationApplier, LearnOrchestrator, LlmCapabilities, OrchestratorSettings, PlaybookLocks,
};
use crate::store::PlaybookStore;

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub store: PlaybookStore,
    pub orchestrator: Arc<LearnOrchestrator>,
    /// Shared with the orchestrator's applier
    pub locks: PlaybookLocks,
    pub default_k: usize,
}

impl AppState {
    /// Wire the store, capabilities and worker pool together.
    /// Must be called inside a tokio runtime.
    pub fn build(store: PlaybookStore, config: &Config) -> Self {
        let capabilities = Arc::new(LlmCapabilities::from_config(&config.llm));
        let locks = PlaybookLocks::new();
        let applier = CurationApplier::new(store.clone(), locks.clone());
        let orchestrator = LearnOrchestrator::start(
            store.clone(),
            capabilities.clone(),
            capabilities,
            applier,
            OrchestratorSettings::from(&config.learning),
        );

        Self {
            store,
            orchestrator: Arc::new(orchestrator),
            locks,
            default_k: config.learning.default_k,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(http::health_handler))
        .route(
            "/playbooks",
            get(http::list_playbooks_handler).post(http::create_playbook_handler),
        )
        .route(
            "/playbooks/{id}",
            get(http::get_playbook_handler).patch(http::update_playbook_handler),
        )
        .route("/playbooks/{id}/embed_prompt", post(http::embed_prompt_handler))
        .route(
            "/playbooks/{id}/bullets",
            get(http::list_bullets_handler).post(http::create_bullet_handler),
        )
        .route("/playbooks/{id}/retrieve", post(http::retrieve_handler))
        .route("/playbooks/{id}/bullets/retrieve", post(http::retrieve_handler))
        .route(
            "/playbooks/{id}/bullets/{bullet_id}/content",
            patch(http::update_bullet_content_handler),
        )
        .route(
            "/playbooks/{id}/bullets/{bullet_id}/increment_helpful",
            post(http::increment_helpful_handler),
        )
        .route(
            "/playbooks/{id}/bullets/{bullet_id}/increment_harmful",
            post(http::increment_harmful_handler),
        )
        .route(
            "/playbooks/{id}/bullets/{bullet_id}/increment_neutral",
            post(http::increment_neutral_handler),
        )
        .route("/playbooks/{id}/episodes/learn", post(http::start_learn_handler))
        .route(
            "/playbooks/{id}/episodes/learn/{job_id}",
            get(http::get_learn_job_handler),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and block until Ctrl-C
pub async fn start(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let db_path = config.database_path()?;
    let store = PlaybookStore::open(&db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    if config.llm.resolved_api_key().is_none() {
        warn!("No LLM API key configured; learn jobs will fail until one is set");
    }

    let state = AppState::build(store, &config);
    let resumed = state.orchestrator.resume_incomplete().await?;
    let orchestrator = state.orchestrator.clone();

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("     ACE Playbook Service");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Database: {}", db_path.display());
    println!("✓ Model: {}", config.llm.model);
    println!("✓ Learn workers: {}", config.learning.workers.max(1));
    if resumed > 0 {
        println!("✓ Resumed {} unfinished learn job(s)", resumed);
    }
    println!("🚀 Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, draining learn queue");
    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
