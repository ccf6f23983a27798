#![forbid(unsafe_code)]

//! HTTP surface: routing, request validation and response shaping.
//!
//! Handlers are single-shot. The only thing they share is the storage
//! directory, reached through [`AppState`], and the injected extractor.

use std::{
    path::PathBuf,
    sync::{Arc, LazyLock},
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State, rejection::JsonRejection},
    http::{HeaderValue, Method, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use mime_guess::MimeGuess;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::{fs::File, task};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    error::{ServiceError, ServiceResult},
    extractor::VideoExtractor,
    metadata::VideoDetails,
    storage::Storage,
};

static SUPPORTED_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?(www\.)?(youtube\.com|youtu\.be)/.+$").expect("supported url regex")
});

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    storage: Arc<Storage>,
    extractor: Arc<dyn VideoExtractor>,
}

impl AppState {
    pub fn new(storage: Storage, extractor: Arc<dyn VideoExtractor>) -> Self {
        Self {
            storage: Arc::new(storage),
            extractor,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

#[derive(Debug, Deserialize)]
struct DetailsRequest {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    resolution: Option<Resolution>,
}

/// Clients send the height either as `"720"` or as `720`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Resolution {
    Height(u64),
    Text(String),
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    message: &'static str,
    file_name: String,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/get_video_details", post(get_video_details))
        .route("/download-video", post(download_video))
        .route("/get_video/{file_name}", get(get_video))
        .route("/cleanup", delete(cleanup))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([header::CONTENT_DISPOSITION])
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_video_details(
    State(state): State<AppState>,
    payload: Result<Json<DetailsRequest>, JsonRejection>,
) -> ServiceResult<Json<VideoDetails>> {
    let Json(request) = payload.map_err(reject_body)?;
    let url = non_empty(request.url.as_deref())
        .ok_or_else(|| ServiceError::invalid_input("No URL provided"))?;

    let info = state
        .extractor
        .fetch_metadata(url)
        .await
        .map_err(|err| ServiceError::upstream(format!("Failed to fetch video details: {err}")))?;

    Ok(Json(VideoDetails::from(info)))
}

async fn download_video(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ServiceResult<Json<DownloadResponse>> {
    let Json(request) = payload.map_err(reject_body)?;
    let url = non_empty(request.url.as_deref())
        .filter(|url| is_supported_url(url))
        .ok_or_else(|| ServiceError::invalid_input("Invalid YouTube URL"))?;
    let max_height = parse_resolution(request.resolution)?;

    let staging = state
        .storage
        .staging_dir()
        .map_err(|err| ServiceError::filesystem(format!("Failed to download video: {err}")))?;

    tracing::info!(%url, max_height, "starting download");
    let downloaded = match state
        .extractor
        .download(url, max_height, staging.path())
        .await
    {
        Ok(path) => path,
        Err(err) => {
            discard_staging(staging).await;
            return Err(ServiceError::upstream(format!(
                "Failed to download video: {err}"
            )));
        }
    };

    let storage = Arc::clone(&state.storage);
    let file_name = task::spawn_blocking(move || {
        let stored = storage.persist(&downloaded);
        drop(staging);
        stored
    })
    .await
    .map_err(|err| ServiceError::filesystem(format!("task join error: {err}")))?
    .map_err(|err| ServiceError::filesystem(format!("Failed to download video: {err}")))?;

    Ok(Json(DownloadResponse {
        message: "Download successful",
        file_name,
    }))
}

/// Removes a staging directory off the async workers.
async fn discard_staging(staging: TempDir) {
    let path = staging.path().to_path_buf();
    match task::spawn_blocking(move || staging.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(path = %path.display(), "failed to remove staging directory: {err}")
        }
        Err(err) => tracing::warn!("staging cleanup task failed: {err}"),
    }
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(file_name): AxumPath<String>,
) -> ServiceResult<Response> {
    let path = state.storage.resolve(&file_name)?;
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(ServiceError::not_found("File not found")),
    }
    serve_attachment(path).await
}

async fn cleanup(State(state): State<AppState>) -> ServiceResult<Json<MessageResponse>> {
    state.storage.clear().await?;
    Ok(Json(MessageResponse {
        message: "Cleanup successful.",
    }))
}

fn reject_body(rejection: JsonRejection) -> ServiceError {
    ServiceError::invalid_input(format!("Invalid request body: {}", rejection.body_text()))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

pub fn is_supported_url(url: &str) -> bool {
    SUPPORTED_URL.is_match(url)
}

/// Accepts `720`, `"720"` or `"720p"`. The value ends up inside a yt-dlp
/// format selector, so only positive integers get through.
fn parse_resolution(resolution: Option<Resolution>) -> ServiceResult<u32> {
    let missing = || ServiceError::invalid_input("No Resolution provided");
    let invalid = || ServiceError::invalid_input("Invalid resolution");
    let height = match resolution.ok_or_else(missing)? {
        Resolution::Height(height) => u32::try_from(height).map_err(|_| invalid())?,
        Resolution::Text(text) => {
            let text = non_empty(Some(text.as_str())).ok_or_else(missing)?;
            let digits = text.strip_suffix(['p', 'P']).unwrap_or(text);
            digits.parse::<u32>().map_err(|_| invalid())?
        }
    };
    if height == 0 {
        return Err(invalid());
    }
    Ok(height)
}

async fn serve_attachment(path: PathBuf) -> ServiceResult<Response> {
    let file = File::open(&path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ServiceError::not_found("File not found")
        } else {
            ServiceError::filesystem(err.to_string())
        }
    })?;
    let size = file
        .metadata()
        .await
        .map_err(|err| ServiceError::filesystem(err.to_string()))?
        .len();

    let download_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let disposition = HeaderValue::from_str(&content_disposition(&download_name))
        .map_err(|err| ServiceError::filesystem(err.to_string()))?;
    let mime = MimeGuess::from_path(&path).first_or_octet_stream();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

/// `attachment` with an ASCII fallback name plus the exact UTF-8 name.
fn content_disposition(file_name: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_fallback(file_name),
        urlencoding::encode(file_name)
    )
}

fn ascii_fallback(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if fallback.starts_with('.') {
        format!("download{fallback}")
    } else {
        fallback
    }
}
