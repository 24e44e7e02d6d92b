//! HTTP request surface: intake, status polling, history. The pipeline runs
//! on a detached task per story so a crashed run can never take down the
//! request handlers.
use crate::db;
use crate::model::{CreationMetadata, MaturityTier, StoryRecord};
use crate::pipeline::{self, AudioInput, PipelineDeps};
use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub deps: PipelineDeps,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/create/text", post(create_from_text))
        .route("/api/create/audio", post(create_from_audio))
        .route("/api/story/:id", get(get_status))
        .route("/api/history", get(list_history))
        .with_state(state)
}

pub type ApiResult<T> = Result<T, (StatusCode, String)>;

fn internal(err: anyhow::Error) -> (StatusCode, String) {
    error!(?err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

#[derive(Debug, Deserialize)]
pub struct CreateTextRequest {
    pub prompt_text: String,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default)]
    pub maturity: MaturityTier,
}

fn default_theme() -> String {
    "Fun".to_string()
}

#[instrument(skip_all)]
async fn create_from_text(
    State(state): State<AppState>,
    Json(req): Json<CreateTextRequest>,
) -> ApiResult<Json<StoryRecord>> {
    let metadata = CreationMetadata {
        prompt_text: Some(req.prompt_text),
        theme: req.theme,
        maturity: req.maturity,
        audio_url: None,
    };
    let record = start_story(&state, metadata, None).await.map_err(internal)?;
    Ok(Json(record))
}

#[instrument(skip_all)]
async fn create_from_audio(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<StoryRecord>> {
    let mut audio_bytes: Vec<u8> = Vec::new();
    let mut mime_type = "audio/webm".to_string();
    let mut theme = default_theme();
    let mut maturity = MaturityTier::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                if let Some(ct) = field.content_type() {
                    mime_type = ct.to_string();
                }
                audio_bytes = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
                    .to_vec();
            }
            "theme" => {
                theme = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
            }
            "maturity" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
                maturity = MaturityTier::parse(&raw).ok_or_else(|| {
                    (StatusCode::BAD_REQUEST, format!("unknown maturity '{raw}'"))
                })?;
            }
            _ => {}
        }
    }

    let record = audio_intake(&state, audio_bytes, mime_type, theme, maturity).await?;
    Ok(Json(record))
}

/// Audio intake body, separated from multipart parsing so the rejection
/// rules are testable directly.
pub async fn audio_intake(
    state: &AppState,
    audio_bytes: Vec<u8>,
    mime_type: String,
    theme: String,
    maturity: MaturityTier,
) -> ApiResult<StoryRecord> {
    // Reject before any record exists; no orphan queued stories.
    if audio_bytes.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Audio file is empty".to_string()));
    }
    info!(bytes = audio_bytes.len(), %mime_type, "received audio intake");

    let audio_url = state
        .deps
        .blob
        .put(&audio_bytes, &mime_type)
        .await
        .map_err(internal)?;

    let metadata = CreationMetadata {
        prompt_text: Some("Audio Input".to_string()),
        theme,
        maturity,
        audio_url: Some(audio_url),
    };
    let audio = AudioInput {
        bytes: audio_bytes,
        mime_type,
    };
    start_story(state, metadata, Some(audio)).await.map_err(internal)
}

/// Persist a queued record, then hand the run to a detached task.
async fn start_story(
    state: &AppState,
    metadata: CreationMetadata,
    audio: Option<AudioInput>,
) -> anyhow::Result<StoryRecord> {
    let record = StoryRecord::new(Uuid::new_v4().to_string(), metadata.clone());
    db::insert_story(&state.deps.pool, &record).await?;

    let deps = state.deps.clone();
    let story_id = record.id.clone();
    tokio::spawn(async move {
        pipeline::run(deps, story_id, metadata, audio).await;
    });

    Ok(record)
}

#[instrument(skip_all, fields(story_id = %story_id))]
async fn get_status(
    State(state): State<AppState>,
    Path(story_id): Path<String>,
) -> ApiResult<Json<StoryRecord>> {
    let record = db::get_story(&state.deps.pool, &story_id)
        .await
        .map_err(internal)?
        .unwrap_or_else(|| StoryRecord::not_found(&story_id));
    Ok(Json(record))
}

#[instrument(skip_all)]
async fn list_history(State(state): State<AppState>) -> ApiResult<Json<Vec<StoryRecord>>> {
    let records = db::list_stories(&state.deps.pool).await.map_err(internal)?;
    Ok(Json(records))
}
