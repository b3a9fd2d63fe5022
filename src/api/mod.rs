//! REST ingress surface (spec.md §6): wire types, error mapping, shared
//! state, and the router that ties handlers to routes. Mirrors the
//! teacher's `gateway` module split (`types`/`handlers`/`state`/`openapi`
//! as separate files, one `pub fn` that assembles the final `Router`).

pub mod dto;
pub mod error_response;
pub mod handlers;
pub mod openapi;
pub mod state;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

/// Assemble the full `Router`: the trade-capture/job surface from spec.md
/// §6, the downstream-publish WebSocket upgrade, and the Swagger UI +
/// OpenAPI JSON the teacher's gateway also exposes at `/docs`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/trades/capture", post(handlers::capture_trade))
        .route("/trades/capture/{tradeId}", get(handlers::get_blotter))
        .route("/trades/manual-entry", post(handlers::manual_entry))
        .route("/trades/upload", post(handlers::upload_trades))
        .route("/trades/jobs/{jobId}/status", get(handlers::get_job_status))
        .route("/trades/jobs/{jobId}", delete(handlers::cancel_job))
        .route("/health", get(handlers::health))
        .route("/backpressure/status", get(handlers::backpressure_status));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws/trades", get(crate::publisher::websocket::ws_publish_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
        .with_state(state)
}
