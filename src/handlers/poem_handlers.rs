//! HTTP handlers for poem generation and the CRUD surface over poem records.
//!
//! `/generate` accepts either a multipart form (an `image` file plus optional
//! `style`/`userId` fields) or a JSON body carrying a remote URL or base64
//! buffer. Every accepted request resolves to 201; the degraded branches are
//! the orchestrator's concern.

use crate::{
    AppState,
    errors::AppError,
    models::{poem::PoemDetail, upload::ImagePayload},
    services::poem_service::{FeedbackPatch, GenerateRequest, ListParams, SortOrder},
};
use axum::{
    Json,
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

const MAX_COMMENT_CHARS: usize = 500;

/// JSON body variant of the generate request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    pub image_url: Option<String>,
    pub image_buffer: Option<String>,
    pub style: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub style: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub sort: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    pub rating: Option<i64>,
    pub comment: Option<String>,
    pub liked: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

/// `POST /api/poetry/generate`
pub async fn generate_poem(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> Result<impl IntoResponse, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let (payload, style, user_id) = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| AppError::bad_request(format!("invalid multipart body: {e}")))?;
        read_generate_form(multipart).await?
    } else {
        let Json(body): Json<GenerateBody> = Json::from_request(request, &())
            .await
            .map_err(|e| AppError::bad_request(format!("invalid JSON body: {e}")))?;
        let payload = match (body.image_url, body.image_buffer) {
            (Some(url), _) if !url.trim().is_empty() => Some(ImagePayload::RemoteUrl(url)),
            (_, Some(buffer)) if !buffer.trim().is_empty() => Some(ImagePayload::Base64(buffer)),
            _ => None,
        };
        (payload, body.style, body.user_id)
    };

    // The single hard precondition: some image source must be present.
    let payload = payload.ok_or_else(|| {
        AppError::bad_request("no image provided: expected an `image` file, `imageUrl`, or `imageBuffer`")
    })?;

    let outcome = state
        .poems
        .generate(GenerateRequest {
            payload,
            style_tag: style,
            user_id,
            client_ip: client_ip(&headers),
            user_agent: header_string(&headers, header::USER_AGENT.as_str()),
        })
        .await;

    let length = outcome.lines.len();
    let mut body = json!({
        "success": true,
        "data": {
            "poetry": {
                "id": outcome.id,
                "content": outcome.lines,
                "style": outcome.style.as_tag(),
                "title": outcome.title,
                "length": length,
            },
            "imageRecognition": {
                "description": outcome.description,
                "labels": [],
                "objects": [],
            },
            "analysis": outcome.analysis,
            "imageUrl": outcome.image_url,
            "generation": {
                "processingTime": outcome.processing_ms,
                "model": outcome.model,
            },
        },
    });
    if !outcome.persisted {
        body["note"] =
            json!("the poem was generated but could not be saved; the id is not durable");
    }

    Ok((StatusCode::CREATED, Json(body)))
}

async fn read_generate_form(
    mut multipart: Multipart,
) -> Result<(Option<ImagePayload>, Option<String>, Option<String>), AppError> {
    let mut payload = None;
    let mut style = None;
    let mut user_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("invalid multipart field: {e}")))?
    {
        match field.name().unwrap_or("") {
            "image" => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(format!("failed to read image: {e}")))?;
                payload = Some(ImagePayload::Bytes {
                    data,
                    filename,
                    content_type,
                });
            }
            "style" => style = field.text().await.ok(),
            "userId" | "user_id" => user_id = field.text().await.ok(),
            _ => {}
        }
    }

    Ok((payload, style, user_id))
}

/// `GET /api/poetry`
pub async fn list_poems(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(10).clamp(1, 50);
    let sort = match query.sort.as_deref() {
        Some("popular") => SortOrder::Popular,
        _ => SortOrder::Latest,
    };

    let (rows, total) = state
        .poems
        .list(ListParams {
            page,
            limit,
            style: query.style,
            user_id: query.user_id,
            sort,
        })
        .await?;

    let items: Vec<PoemDetail> = rows.iter().map(PoemDetail::from).collect();
    Ok(Json(json!({
        "success": true,
        "data": {
            "items": items,
            "pagination": { "page": page, "limit": limit, "total": total },
        },
    })))
}

/// `GET /api/poetry/{id}`
pub async fn get_poem(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let record = state.poems.find_by_id(&id).await?;
    Ok(Json(json!({
        "success": true,
        "data": PoemDetail::from(&record),
    })))
}

/// `PUT /api/poetry/{id}/feedback`
///
/// Validates before touching persistence: rating must be 1 through 5 and the
/// comment at most 500 characters.
pub async fn update_feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FeedbackBody>,
) -> Result<impl IntoResponse, AppError> {
    validate_feedback(&body)?;

    let record = state
        .poems
        .update_feedback(
            &id,
            FeedbackPatch {
                rating: body.rating,
                comment: body.comment,
                liked: body.liked,
            },
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "data": PoemDetail::from(&record),
    })))
}

/// `POST /api/poetry/{id}/share`
pub async fn share_poem(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (share_count, share_url) = state.poems.increment_share(&id).await?;
    Ok(Json(json!({
        "success": true,
        "data": { "shareCount": share_count, "shareUrl": share_url },
    })))
}

/// `DELETE /api/poetry/{id}`
pub async fn delete_poem(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, AppError> {
    state.poems.delete(&id, query.user_id.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reject invalid feedback before it ever reaches persistence.
fn validate_feedback(body: &FeedbackBody) -> Result<(), AppError> {
    if let Some(rating) = body.rating {
        if !(1..=5).contains(&rating) {
            return Err(AppError::bad_request("rating must be between 1 and 5"));
        }
    }
    if let Some(comment) = &body.comment {
        if comment.chars().count() > MAX_COMMENT_CHARS {
            return Err(AppError::bad_request(format!(
                "comment must be at most {MAX_COMMENT_CHARS} characters"
            )));
        }
    }
    Ok(())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Best-effort client IP from proxy headers.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "x-forwarded-for")
        .map(|v| v.split(',').next().unwrap_or(&v).trim().to_string())
        .or_else(|| header_string(headers, "x-real-ip"))
}
