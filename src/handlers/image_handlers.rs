//! Direct storage-upload entry points, usable independently of poem
//! generation. Unlike `/generate`, these surface real storage errors to the
//! caller instead of degrading.

use crate::{AppState, errors::AppError, models::upload::ImagePayload};
use axum::{
    Json,
    extract::{Multipart, Path as UrlPath, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use std::{
    path::{Component, Path},
    time::Duration,
};

use crate::services::image_service::UploadMode;

/// Validity window of signed URLs returned by the info endpoint.
const SIGNED_URL_TTL: Duration = Duration::from_secs(3600);

const DEFAULT_FOLDER: &str = "uploads";

#[derive(Debug, Deserialize)]
pub struct UploadUrlBody {
    pub url: String,
    pub folder: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadLocalBody {
    pub path: String,
    pub folder: Option<String>,
}

/// `POST /api/images/upload` — size threshold picks the upload path.
pub async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    upload_form(state, multipart, UploadMode::Auto).await
}

/// `POST /api/images/upload-multipart` — always the chunked path.
pub async fn upload_multipart(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    upload_form(state, multipart, UploadMode::Chunked).await
}

async fn upload_form(
    state: AppState,
    mut multipart: Multipart,
    mode: UploadMode,
) -> Result<impl IntoResponse, AppError> {
    let mut payload = None;
    let mut folder = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("invalid multipart field: {e}")))?
    {
        match field.name().unwrap_or("") {
            "image" | "file" => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(format!("failed to read file: {e}")))?;
                payload = Some(ImagePayload::Bytes {
                    data,
                    filename,
                    content_type,
                });
            }
            "folder" => folder = field.text().await.ok(),
            _ => {}
        }
    }

    let payload =
        payload.ok_or_else(|| AppError::bad_request("no file provided in `image` field"))?;
    let folder = folder.unwrap_or_else(|| DEFAULT_FOLDER.to_string());

    let stored = state.images.ingest(payload, &folder, mode).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": stored })),
    ))
}

/// `POST /api/images/upload-url` — fetch a remote image, then store it.
pub async fn upload_url(
    State(state): State<AppState>,
    Json(body): Json<UploadUrlBody>,
) -> Result<impl IntoResponse, AppError> {
    if body.url.trim().is_empty() {
        return Err(AppError::bad_request("`url` must not be empty"));
    }
    let folder = body.folder.unwrap_or_else(|| DEFAULT_FOLDER.to_string());
    let stored = state
        .images
        .ingest(ImagePayload::RemoteUrl(body.url), &folder, UploadMode::Auto)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": stored })),
    ))
}

/// `GET /api/images/info/{*key}` — stored-object metadata plus a
/// time-limited signed URL.
pub async fn image_info(
    State(state): State<AppState>,
    UrlPath(key): UrlPath<String>,
) -> Result<impl IntoResponse, AppError> {
    let (info, signed_url) = state.images.describe(&key, SIGNED_URL_TTL).await?;
    Ok(Json(json!({
        "success": true,
        "data": {
            "key": key,
            "size": info.size,
            "contentType": info.content_type,
            "etag": info.etag,
            "signedUrl": signed_url,
        },
    })))
}

/// `POST /api/images/upload-local` — import a file from the configured local
/// import directory. Paths outside that directory are rejected.
pub async fn upload_local(
    State(state): State<AppState>,
    Json(body): Json<UploadLocalBody>,
) -> Result<impl IntoResponse, AppError> {
    let relative = Path::new(&body.path);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(AppError::bad_request(
            "`path` must be relative to the import directory",
        ));
    }

    let full_path = Path::new(&state.local_import_dir).join(relative);
    let data = tokio::fs::read(&full_path)
        .await
        .map_err(|e| AppError::bad_request(format!("cannot read `{}`: {e}", body.path)))?;

    let filename = relative
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string);
    let folder = body.folder.unwrap_or_else(|| DEFAULT_FOLDER.to_string());
    let stored = state
        .images
        .ingest(
            ImagePayload::Bytes {
                data: data.into(),
                filename,
                content_type: None,
            },
            &folder,
            UploadMode::Auto,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": stored })),
    ))
}
