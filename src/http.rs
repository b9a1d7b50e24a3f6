//! HTTP facade over the campaign core.
//!
//! Thin translation layer: JSON in, core calls, JSON out. The owner comes
//! from the `x-user-id` header (demo-grade identity, supplied by the
//! gateway in front of this service).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::campaign::{Core, SubmitError, SubmitInput};
use crate::mail::Attachment;
use crate::store::StoreError;

pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/emails/schedule", post(schedule))
        .route("/emails/scheduled", get(scheduled))
        .route("/emails/sent", get(sent))
        .route("/emails/schedule/:id", get(campaign_detail))
        .route("/emails/queue/status", get(queue_status))
        .with_state(core)
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("x-user-id header is required")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("service unavailable")]
    Unavailable,

    #[error("an internal error occurred")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Trace server errors since the response body stays generic.
        if self.status().is_server_error() {
            tracing::error!(status = %self.status(), error = %self, "request failed");
        }
        let body = Json(json!({
            "code": self.status().as_u16(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::Validation(message) => Self::BadRequest(message),
            SubmitError::Store(StoreError::Backend(_)) => Self::Unavailable,
            SubmitError::Store(other) => Self::Internal(other.to_string()),
        }
    }
}

fn owner_from(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().to_string())
        .ok_or(ApiError::Unauthorized)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    subject: String,
    body: String,
    recipients: Vec<String>,
    /// ISO-8601 UTC instant.
    start_time: String,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    hourly_limit: Option<u32>,
    #[serde(default)]
    attachments: Vec<AttachmentDto>,
    /// Optional idempotency key.
    #[serde(default)]
    campaign_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentDto {
    filename: String,
    content_type: String,
    /// Base64-encoded payload.
    content: String,
}

async fn schedule(
    State(core): State<Arc<Core>>,
    headers: HeaderMap,
    Json(request): Json<ScheduleRequest>,
) -> Result<Response, ApiError> {
    let owner = owner_from(&headers)?;

    let start_time = OffsetDateTime::parse(&request.start_time, &Rfc3339)
        .map_err(|_| ApiError::BadRequest(format!("invalid startTime: {}", request.start_time)))?;

    let attachments = request
        .attachments
        .into_iter()
        .map(|dto| {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(dto.content.as_bytes())
                .map_err(|_| {
                    ApiError::BadRequest(format!("attachment {} is not valid base64", dto.filename))
                })?;
            Ok(Attachment {
                filename: dto.filename,
                content_type: dto.content_type,
                bytes,
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    let receipt = core
        .submit(SubmitInput {
            campaign_id: request.campaign_id,
            owner,
            subject: request.subject,
            body: request.body,
            recipients: request.recipients,
            start_time,
            delay_ms: request.delay_ms,
            hourly_limit: request.hourly_limit,
            attachments,
        })
        .await?;

    let body = Json(json!({
        "scheduleId": receipt.campaign_id,
        "totalEmails": receipt.total_emails,
        "status": receipt.status,
        "createdJobs": receipt.created_jobs,
    }));
    Ok((StatusCode::CREATED, body).into_response())
}

async fn scheduled(
    State(core): State<Arc<Core>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let owner = owner_from(&headers)?;
    let campaigns = core.campaigns_by_owner(&owner).await?;
    Ok(Json(campaigns).into_response())
}

async fn sent(State(core): State<Arc<Core>>, headers: HeaderMap) -> Result<Response, ApiError> {
    let owner = owner_from(&headers)?;
    let jobs = core.terminal_jobs_by_owner(&owner).await?;
    Ok(Json(jobs).into_response())
}

async fn campaign_detail(
    State(core): State<Arc<Core>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let owner = owner_from(&headers)?;
    let detail = core.campaign(id).await?.ok_or(ApiError::NotFound)?;
    if detail.campaign.owner != owner {
        return Err(ApiError::NotFound);
    }
    Ok(Json(detail).into_response())
}

async fn queue_status(State(core): State<Arc<Core>>) -> Response {
    Json(core.queue_stats().await).into_response()
}

async fn health(State(core): State<Arc<Core>>) -> Response {
    if core.is_healthy() {
        Json(json!({"ok": true})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ok": false, "message": "storage unavailable"})),
        )
            .into_response()
    }
}
