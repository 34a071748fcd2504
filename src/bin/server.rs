use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use futures::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

use ursceal_core::config::Config;
use ursceal_core::error::Error;
use ursceal_core::orchestrator::{self, GenerateRequest, RequestType};
use ursceal_core::storage::Storage;
use ursceal_core::storage::sqlite::SqliteStorage;

#[derive(Clone)]
struct AppState {
    storage: Arc<dyn Storage>,
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    #[serde(rename = "storyId")]
    story_id: Uuid,
    #[serde(rename = "type")]
    generation_type: String,
    #[serde(rename = "customPrompt", default)]
    custom_prompt: Option<String>,
    #[serde(rename = "characterId", default)]
    character_id: Option<Uuid>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Error)
        .filter_module("ursceal_core", log::LevelFilter::Trace)
        .filter_module("ursceal_server", log::LevelFilter::Trace)
        .init();

    let config_path = std::env::var("URSCEAL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("ursceal.yaml"));
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        log::warn!("no config at {config_path:?} ({e}), using defaults");
        Config::default()
    });

    let storage = SqliteStorage::open(&config.db_path())?;
    let state = AppState { storage: Arc::new(storage) };

    let app = axum::Router::new()
        .route("/api/generate", post(generate_handler))
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    log::info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn generate_handler(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Response {
    let request_type = match body.generation_type.as_str() {
        "continue" => RequestType::Continue,
        "character" => match body.character_id {
            Some(character_id) => RequestType::Character { character_id },
            None => {
                return validation_error("characterId is required for type \"character\"");
            }
        },
        "custom" => {
            RequestType::Custom { instruction: body.custom_prompt.unwrap_or_default() }
        }
        "rewrite-third-person" => RequestType::RewriteThirdPerson,
        other => return validation_error(&format!("unknown generation type: {other}")),
    };

    let request = GenerateRequest { story_id: body.story_id, request_type };

    match orchestrator::generate(state.storage.as_ref(), request).await {
        Ok(stream) => {
            let body = Body::from_stream(stream.map(|chunk| Ok::<_, std::io::Error>(chunk)));
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache, no-transform")
                .header(header::CONNECTION, "keep-alive")
                .header("X-Accel-Buffering", HeaderValue::from_static("no"))
                .body(body)
                .unwrap()
        }
        Err(e) => error_response(&e),
    }
}

fn validation_error(message: &str) -> Response {
    error_response(&Error::Validation(message.to_string()))
}

fn error_response(error: &Error) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(serde_json::json!({ "error": error.to_string() }))).into_response()
}
