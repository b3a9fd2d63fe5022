//! OpenAPI / Swagger UI documentation for the REST surface in spec.md §6.
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`
//!
//! Grounded in the teacher's `gateway::openapi::ApiDoc` (a `#[derive(OpenApi)]`
//! struct enumerating handler paths and response schemas); trimmed of the
//! teacher's Ed25519 security-scheme addon since this surface has no
//! per-request signing.

use utoipa::OpenApi;

use crate::api::dto::{
    CaptureRequestBody, DuplicateResponse, HealthResponse, JobCancelledResponse,
    SubmitAcceptedResponse, UploadAcceptedResponse, UploadSummary,
};
use crate::domain::{EnrichmentStatus, Job, JobStatus, SwapBlotter};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "PSTPP Trade Capture API",
        version = "0.1.0",
        description = "Partition-Serialized Trade Processing Pipeline: ingress, idempotent capture, and async job tracking for synthetic-swap trades.",
        license(name = "MIT")
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development"),
    ),
    paths(
        super::handlers::capture_trade,
        super::handlers::manual_entry,
        super::handlers::upload_trades,
        super::handlers::get_blotter,
        super::handlers::get_job_status,
        super::handlers::cancel_job,
        super::handlers::health,
        super::handlers::backpressure_status,
    ),
    components(
        schemas(
            CaptureRequestBody,
            SubmitAcceptedResponse,
            DuplicateResponse,
            UploadAcceptedResponse,
            UploadSummary,
            JobCancelledResponse,
            HealthResponse,
            SwapBlotter,
            EnrichmentStatus,
            Job,
            JobStatus,
        )
    ),
    tags(
        (name = "Trade Capture", description = "Ingress endpoints for synthetic-swap trades"),
        (name = "Jobs", description = "Async job lifecycle polling and cancellation"),
        (name = "System", description = "Health and backpressure introspection"),
    )
)]
pub struct ApiDoc;
