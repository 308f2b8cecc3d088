//! HTTP handlers for playbooks, bullets and learn jobs

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{AceError, AceResult};
use crate::prompt;
use crate::retrieval;
use crate::server::AppState;
use crate::types::{LearnRequest, Playbook, Tag};

#[derive(Debug, Deserialize)]
pub struct EmbedPromptRequest {
    pub prompt: String,
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub user_message: String,
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePlaybookRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePlaybookRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Body for bullet creation and content edits
#[derive(Debug, Deserialize)]
pub struct BulletContentRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Look up a playbook without creating it
async fn require_playbook(state: &AppState, playbook_id: &str) -> AceResult<Playbook> {
    state
        .store
        .get_playbook(playbook_id)
        .await?
        .ok_or_else(|| AceError::not_found(format!("playbook {}", playbook_id)))
}

/// Retrieve the top-k bullets for `prompt` and embed them between the markers
pub async fn embed_prompt_handler(
    State(state): State<AppState>,
    Path(playbook_id): Path<String>,
    Json(req): Json<EmbedPromptRequest>,
) -> AceResult<impl IntoResponse> {
    let k = req.k.unwrap_or(state.default_k);
    state.store.get_or_create_playbook(&playbook_id).await?;
    let bullets = state.store.list_bullets(&playbook_id).await?;
    let retrieved = retrieval::rank(&bullets, &req.prompt, k);
    debug!(
        playbook_id = %playbook_id,
        available = bullets.len(),
        retrieved = retrieved.len(),
        "Embedding playbook"
    );

    Ok(Json(json!({ "prompt": prompt::embed(&req.prompt, &retrieved) })))
}

pub async fn retrieve_handler(
    State(state): State<AppState>,
    Path(playbook_id): Path<String>,
    Json(req): Json<RetrieveRequest>,
) -> AceResult<impl IntoResponse> {
    let k = req.k.unwrap_or(state.default_k);
    require_playbook(&state, &playbook_id).await?;
    let bullets = state.store.list_bullets(&playbook_id).await?;
    let retrieved = retrieval::rank(&bullets, &req.user_message, k);

    Ok(Json(json!({ "retrieved_bullets": retrieved })))
}

pub async fn list_playbooks_handler(State(state): State<AppState>) -> AceResult<impl IntoResponse> {
    let playbooks = state.store.list_playbooks().await?;
    Ok(Json(json!({ "playbooks": playbooks })))
}

pub async fn create_playbook_handler(
    State(state): State<AppState>,
    Json(req): Json<CreatePlaybookRequest>,
) -> AceResult<impl IntoResponse> {
    let playbook = state.store.create_playbook(req.name, req.description).await?;
    Ok((StatusCode::CREATED, Json(json!({ "playbook": playbook }))))
}

pub async fn get_playbook_handler(
    State(state): State<AppState>,
    Path(playbook_id): Path<String>,
) -> AceResult<impl IntoResponse> {
    let playbook = require_playbook(&state, &playbook_id).await?;
    Ok(Json(json!({ "playbook": playbook })))
}

pub async fn update_playbook_handler(
    State(state): State<AppState>,
    Path(playbook_id): Path<String>,
    Json(req): Json<UpdatePlaybookRequest>,
) -> AceResult<impl IntoResponse> {
    require_playbook(&state, &playbook_id).await?;
    let playbook = state
        .store
        .update_playbook(&playbook_id, req.name, req.description)
        .await?;
    Ok(Json(json!({ "playbook": playbook })))
}

pub async fn list_bullets_handler(
    State(state): State<AppState>,
    Path(playbook_id): Path<String>,
) -> AceResult<impl IntoResponse> {
    require_playbook(&state, &playbook_id).await?;
    let bullets = state.store.list_bullets(&playbook_id).await?;
    Ok(Json(json!({ "bullets": bullets })))
}

pub async fn create_bullet_handler(
    State(state): State<AppState>,
    Path(playbook_id): Path<String>,
    Json(req): Json<BulletContentRequest>,
) -> AceResult<impl IntoResponse> {
    require_playbook(&state, &playbook_id).await?;
    let _guard = state.locks.lock(&playbook_id).await;
    let bullet = state.store.create_bullet(&playbook_id, &req.content).await?;
    Ok((StatusCode::CREATED, Json(json!({ "bullet": bullet }))))
}

pub async fn update_bullet_content_handler(
    State(state): State<AppState>,
    Path((playbook_id, bullet_id)): Path<(String, String)>,
    Json(req): Json<BulletContentRequest>,
) -> AceResult<impl IntoResponse> {
    require_playbook(&state, &playbook_id).await?;
    let _guard = state.locks.lock(&playbook_id).await;
    let bullet = state
        .store
        .update_bullet_content(&playbook_id, &bullet_id, &req.content)
        .await?;
    Ok(Json(json!({ "bullet": bullet })))
}

async fn increment(
    state: &AppState,
    playbook_id: &str,
    bullet_id: &str,
    tag: Tag,
) -> AceResult<Json<serde_json::Value>> {
    require_playbook(state, playbook_id).await?;
    let _guard = state.locks.lock(playbook_id).await;
    let bullet = state.store.increment_counter(playbook_id, bullet_id, tag).await?;
    Ok(Json(json!({ "bullet": bullet })))
}

pub async fn increment_helpful_handler(
    State(state): State<AppState>,
    Path((playbook_id, bullet_id)): Path<(String, String)>,
) -> AceResult<impl IntoResponse> {
    increment(&state, &playbook_id, &bullet_id, Tag::Helpful).await
}

pub async fn increment_harmful_handler(
    State(state): State<AppState>,
    Path((playbook_id, bullet_id)): Path<(String, String)>,
) -> AceResult<impl IntoResponse> {
    increment(&state, &playbook_id, &bullet_id, Tag::Harmful).await
}

pub async fn increment_neutral_handler(
    State(state): State<AppState>,
    Path((playbook_id, bullet_id)): Path<(String, String)>,
) -> AceResult<impl IntoResponse> {
    increment(&state, &playbook_id, &bullet_id, Tag::Neutral).await
}

/// Accept an agent run for learning; the pipeline runs in the background
pub async fn start_learn_handler(
    State(state): State<AppState>,
    Path(playbook_id): Path<String>,
    Json(req): Json<LearnRequest>,
) -> AceResult<impl IntoResponse> {
    let job = state.orchestrator.start_learn(&playbook_id, req).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "learn_job_id": job.id }))))
}

pub async fn get_learn_job_handler(
    State(state): State<AppState>,
    Path((playbook_id, job_id)): Path<(String, String)>,
) -> AceResult<impl IntoResponse> {
    require_playbook(&state, &playbook_id).await?;
    let job = state.orchestrator.get_job(&playbook_id, &job_id).await?;
    Ok(Json(json!({ "learn_job": job })))
}
