//! REST handlers for the ingress surface named in spec.md §6. Each follows
//! the teacher's shape: a thin async fn taking `State<Arc<AppState>>` plus
//! whatever extractors the route needs, returning a type implementing
//! `IntoResponse`.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::dto::{
    CaptureRequestBody, DuplicateResponse, ErrorDetail, HealthResponse, JobCancelledResponse,
    SubmitAcceptedResponse, UploadAcceptedResponse, UploadSummary,
};
use crate::api::error_response::ApiError;
use crate::api::state::AppState;
use crate::backpressure::ApiAdmission;
use crate::dispatcher::SubmitOutcome;
use crate::domain::trade_request::Source;
use crate::error::PstppError;
use crate::job_registry::CancelOutcome;
use crate::upload::{self, UploadFormat};

const CALLBACK_URL_HEADER: &str = "x-callback-url";

fn required_callback_url(headers: &HeaderMap) -> Result<String, PstppError> {
    headers
        .get(CALLBACK_URL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PstppError::Validation("X-Callback-Url header is required".into()))
}

/// Saturation check shared by every ingress endpoint: spec.md §4.7 /
/// scenario S5 require a bare `503` with `Retry-After: 5` and no job or
/// idempotency record created when the API admission gauge is full.
fn overloaded_response() -> Response {
    let mut resp = (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({
            "error": ErrorDetail {
                code: "SERVICE_UNAVAILABLE".to_string(),
                message: "API admission saturated".to_string(),
            }
        })),
    )
        .into_response();
    resp.headers_mut().insert("Retry-After", "5".parse().unwrap());
    resp
}

async fn submit_and_respond(
    state: &Arc<AppState>,
    body: CaptureRequestBody,
    source: Source,
    callback_url: String,
) -> Response {
    let request = match body.into_trade_request(source, Some(callback_url)) {
        Ok(r) => r,
        Err(e) => return ApiError(e).into_response(),
    };
    match state.dispatcher.submit(request).await {
        Ok(SubmitOutcome::Accepted { job_id }) => {
            (StatusCode::ACCEPTED, Json(SubmitAcceptedResponse::new(job_id))).into_response()
        }
        Ok(SubmitOutcome::Duplicate { blotter_ref }) => (
            StatusCode::CONFLICT,
            Json(DuplicateResponse {
                blotter_ref,
                error: ErrorDetail {
                    code: "DUPLICATE_TRADE_ID".to_string(),
                    message: "a completed record already exists for this idempotency key".to_string(),
                },
            }),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/trades/capture",
    request_body = CaptureRequestBody,
    responses(
        (status = 202, description = "Accepted for processing", body = SubmitAcceptedResponse),
        (status = 400, description = "Validation failed"),
        (status = 409, description = "Duplicate idempotency key", body = DuplicateResponse),
        (status = 503, description = "API admission saturated"),
    ),
    tag = "Trade Capture"
)]
pub async fn capture_trade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CaptureRequestBody>,
) -> Response {
    let permit = match state.backpressure.try_admit_api() {
        ApiAdmission::Admitted(p) => p,
        ApiAdmission::Rejected => return overloaded_response(),
    };
    let callback_url = match required_callback_url(&headers) {
        Ok(u) => u,
        Err(e) => return ApiError(e).into_response(),
    };
    let resp = submit_and_respond(&state, body, Source::Api, callback_url).await;
    drop(permit);
    resp
}

#[utoipa::path(
    post,
    path = "/api/v1/trades/manual-entry",
    request_body = CaptureRequestBody,
    responses(
        (status = 202, description = "Accepted for processing", body = SubmitAcceptedResponse),
        (status = 400, description = "Validation failed"),
        (status = 409, description = "Duplicate idempotency key", body = DuplicateResponse),
        (status = 503, description = "API admission saturated"),
    ),
    tag = "Trade Capture"
)]
pub async fn manual_entry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CaptureRequestBody>,
) -> Response {
    let permit = match state.backpressure.try_admit_api() {
        ApiAdmission::Admitted(p) => p,
        ApiAdmission::Rejected => return overloaded_response(),
    };
    let callback_url = match required_callback_url(&headers) {
        Ok(u) => u,
        Err(e) => return ApiError(e).into_response(),
    };
    let resp = submit_and_respond(&state, body, Source::Manual, callback_url).await;
    drop(permit);
    resp
}

#[utoipa::path(
    post,
    path = "/api/v1/trades/upload",
    responses(
        (status = 202, description = "Batch accepted", body = UploadAcceptedResponse),
        (status = 400, description = "Unsupported format or too many rows"),
    ),
    tag = "Trade Capture"
)]
pub async fn upload_trades(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let callback_url = match required_callback_url(&headers) {
        Ok(u) => u,
        Err(e) => return ApiError(e).into_response(),
    };

    let field = match multipart.next_field().await {
        Ok(Some(f)) => f,
        Ok(None) => {
            return ApiError(PstppError::Validation("upload requires a file part".into())).into_response()
        }
        Err(e) => return ApiError(PstppError::Validation(e.to_string())).into_response(),
    };
    let filename = field.file_name().unwrap_or("upload").to_string();
    let format = match UploadFormat::from_filename(&filename) {
        Some(f) => f,
        None => {
            return ApiError(PstppError::Validation(format!("unsupported file type: {filename}"))).into_response()
        }
    };
    let bytes = match field.bytes().await {
        Ok(b) => b,
        Err(e) => return ApiError(PstppError::Validation(e.to_string())).into_response(),
    };

    let rows = match upload::parse(format, &bytes, state.upload.max_rows) {
        Ok(rows) => rows,
        Err(e) => return ApiError(e).into_response(),
    };

    let job_id = ulid::Ulid::new().to_string();
    if let Err(e) = state
        .jobs
        .create(job_id.clone(), None, Some(Source::File), Some(callback_url.clone()))
        .await
    {
        return ApiError(e).into_response();
    }

    let total = rows.len();
    let mut valid = 0usize;
    let mut invalid = 0usize;
    let mut published = 0usize;
    for row in rows {
        match row.and_then(|r| r.into_trade_request(Source::File, Some(callback_url.clone()))) {
            Ok(request) => {
                valid += 1;
                match state.dispatcher.submit(request).await {
                    Ok(_) => published += 1,
                    Err(e) => {
                        tracing::warn!(error = %e, "upload row failed to submit");
                        invalid += 1;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "upload row failed validation");
                invalid += 1;
            }
        }
    }

    let _ = state
        .jobs
        .update(
            &job_id,
            crate::job_registry::JobUpdate::completed(serde_json::json!({
                "total": total, "valid": valid, "invalid": invalid, "published": published,
            }))
            .with_status(crate::domain::JobStatus::Processing),
        )
        .await;

    (
        StatusCode::ACCEPTED,
        Json(UploadAcceptedResponse {
            job_id,
            summary: UploadSummary { total, valid, invalid, published },
        }),
    )
        .into_response()
}

#[utoipa::path(
    get,
    path = "/api/v1/trades/capture/{tradeId}",
    responses(
        (status = 200, description = "The persisted blotter"),
        (status = 404, description = "No blotter for this trade id"),
    ),
    tag = "Trade Capture"
)]
pub async fn get_blotter(State(state): State<Arc<AppState>>, Path(trade_id): Path<String>) -> Response {
    match state.blotters.find_by_trade_id(&trade_id).await {
        Ok(Some(blotter)) => (StatusCode::OK, Json(blotter)).into_response(),
        Ok(None) => ApiError(PstppError::NotFound(format!("blotter for trade {trade_id}"))).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/trades/jobs/{jobId}/status",
    responses(
        (status = 200, description = "The job's current status"),
        (status = 404, description = "No such job"),
    ),
    tag = "Jobs"
)]
pub async fn get_job_status(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    match state.jobs.get(&job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => ApiError(PstppError::NotFound(format!("job {job_id}"))).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/api/v1/trades/jobs/{jobId}",
    responses(
        (status = 200, description = "Cancelled", body = JobCancelledResponse),
        (status = 400, description = "Job is not cancellable"),
        (status = 404, description = "No such job"),
    ),
    tag = "Jobs"
)]
pub async fn cancel_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    match state.jobs.cancel(&job_id).await {
        Ok(CancelOutcome::Cancelled) => (
            StatusCode::OK,
            Json(JobCancelledResponse { job_id, status: "CANCELLED".to_string() }),
        )
            .into_response(),
        Ok(CancelOutcome::NotCancellable) => {
            ApiError(PstppError::Validation(format!("job {job_id} is not cancellable"))).into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "System"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "UP".to_string(),
            timestamp: chrono::Utc::now(),
            service: state.service_name.clone(),
        }),
    )
        .into_response()
}

#[utoipa::path(
    get,
    path = "/api/v1/backpressure/status",
    responses((status = 200, description = "Combined backpressure and sequence-buffer status")),
    tag = "System"
)]
pub async fn backpressure_status(State(state): State<Arc<AppState>>) -> Response {
    let body = serde_json::json!({
        "backpressure": state.backpressure.status(),
        "sequenceBuffers": state.sequence_buffer.status().await,
    });
    (StatusCode::OK, Json(body)).into_response()
}
