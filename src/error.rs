//! Crate-wide error type.
//!
//! Every component returns `Result<T, PstppError>` (or a narrower error that
//! converts into it at the API boundary). Each variant carries a machine
//! `.code()` used in REST responses and webhook failure bodies, and an
//! `.http_status()` used by the API layer to pick a response status.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PstppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("duplicate trade id: {0}")]
    DuplicateTradeId(String),

    #[error("lock acquisition failed for {key}: {reason}")]
    LockAcquisitionFailed { key: String, reason: String },

    #[error("sequence gap on partition {partition_key}: expected {expected}, got {got}")]
    SequenceGap {
        partition_key: String,
        expected: u64,
        got: u64,
    },

    #[error("invalid state transition on {partition_key}: {from} -> {to}")]
    InvalidStateTransition {
        partition_key: String,
        from: String,
        to: String,
    },

    #[error("enrichment failed: {0}")]
    EnrichmentFailed(String),

    #[error("rate limited")]
    RateLimited,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("processing error: {0}")]
    ProcessingError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PstppError {
    /// Machine-readable error code, stable across releases, surfaced in REST
    /// error bodies and webhook failure payloads.
    pub fn code(&self) -> &'static str {
        match self {
            PstppError::Validation(_) => "VALIDATION_ERROR",
            PstppError::DuplicateTradeId(_) => "DUPLICATE_TRADE_ID",
            PstppError::LockAcquisitionFailed { .. } => "LOCK_ACQUISITION_FAILED",
            PstppError::SequenceGap { .. } => "SEQUENCE_GAP",
            PstppError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            PstppError::EnrichmentFailed(_) => "ENRICHMENT_FAILED",
            PstppError::RateLimited => "RATE_LIMITED",
            PstppError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            PstppError::ProcessingError(_) => "PROCESSING_ERROR",
            PstppError::NotFound(_) => "NOT_FOUND",
            PstppError::Database(_) => "PROCESSING_ERROR",
            PstppError::Serialization(_) => "PROCESSING_ERROR",
            PstppError::Other(_) => "PROCESSING_ERROR",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            PstppError::Validation(_) => StatusCode::BAD_REQUEST,
            PstppError::DuplicateTradeId(_) => StatusCode::CONFLICT,
            PstppError::LockAcquisitionFailed { .. } => StatusCode::CONFLICT,
            PstppError::SequenceGap { .. } => StatusCode::CONFLICT,
            PstppError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            PstppError::EnrichmentFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PstppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            PstppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PstppError::ProcessingError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PstppError::NotFound(_) => StatusCode::NOT_FOUND,
            PstppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PstppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PstppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a failure of this kind is safe to retry per §7's propagation
    /// rules (transient retried-then-FAILED vs. permanent short-circuit).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PstppError::LockAcquisitionFailed { .. }
                | PstppError::ServiceUnavailable(_)
                | PstppError::Database(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let err = PstppError::Validation("x".into());
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn lock_failure_is_transient_and_conflict() {
        let err = PstppError::LockAcquisitionFailed {
            key: "A_B_C".into(),
            reason: "timeout".into(),
        };
        assert!(err.is_transient());
        assert_eq!(err.http_status(), StatusCode::CONFLICT);
    }

    #[test]
    fn duplicate_trade_id_is_not_transient() {
        let err = PstppError::DuplicateTradeId("T1".into());
        assert!(!err.is_transient());
    }
}
