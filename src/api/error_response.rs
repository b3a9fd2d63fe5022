//! Maps [`PstppError`] onto the REST error envelope `{error:{code,message}}`
//! via `.code()`/`.http_status()`, the same fields the webhook body's
//! `error?: {code,message}` carries (spec.md §6), so a client sees one error
//! shape whether it arrives over the API or a webhook.

use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::dto::ErrorDetail;
use crate::error::PstppError;

pub struct ApiError(pub PstppError);

impl From<PstppError> for ApiError {
    fn from(err: PstppError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        let body = Json(serde_json::json!({
            "error": ErrorDetail {
                code: self.0.code().to_string(),
                message: self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
