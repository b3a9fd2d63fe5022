//! Request/response bodies for the REST surface. Kept separate from
//! [`super::handlers`] the way the teacher splits wire shapes
//! (`gateway::types`) from handler logic.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::trade_request::TradeRequest;
use crate::domain::Source;
use crate::error::PstppError;

/// Inbound trade capture/manual-entry body. `accountId`/`bookId`/`securityId`
/// derive the partition key the same way `TradeRequest::derive_partition_key`
/// does internally; callers never supply the composite key directly.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequestBody {
    pub trade_id: String,
    pub account_id: String,
    pub book_id: String,
    pub security_id: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub sequence_number: Option<u64>,
    #[serde(default)]
    pub booking_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub payload: serde_json::Value,
}

impl CaptureRequestBody {
    pub fn into_trade_request(self, source: Source, callback_url: Option<String>) -> Result<TradeRequest, PstppError> {
        let partition_key = TradeRequest::derive_partition_key(&self.account_id, &self.book_id, &self.security_id);
        TradeRequest::new(
            self.trade_id,
            partition_key,
            self.idempotency_key,
            self.sequence_number,
            self.booking_timestamp,
            source,
            self.payload,
            callback_url,
        )
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAcceptedResponse {
    pub job_id: String,
    pub status: String,
    pub status_url: String,
}

impl SubmitAcceptedResponse {
    pub fn new(job_id: String) -> Self {
        Self {
            status_url: format!("/api/v1/trades/jobs/{job_id}/status"),
            job_id,
            status: "ACCEPTED".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateResponse {
    pub blotter_ref: String,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub published: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadAcceptedResponse {
    pub job_id: String,
    pub summary: UploadSummary,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobCancelledResponse {
    pub job_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub service: String,
}
