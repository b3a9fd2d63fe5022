//! `IdempotencyRecord` — the durable (L2) half of the two-tier idempotency
//! store (C2). See [`crate::idempotency_store`] for the store itself.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default dedupe window: 24 hours.
pub const DEFAULT_WINDOW: Duration = Duration::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Processing => "PROCESSING",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "PROCESSING" => Some(IdempotencyStatus::Processing),
            "COMPLETED" => Some(IdempotencyStatus::Completed),
            "FAILED" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

/// At most one non-archived record exists per `idempotency_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub trade_id: String,
    pub partition_key: String,
    pub status: IdempotencyStatus,
    pub blotter_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub archive_flag: bool,
}

impl IdempotencyRecord {
    pub fn new_processing(idempotency_key: String, trade_id: String, partition_key: String) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key,
            trade_id,
            partition_key,
            status: IdempotencyStatus::Processing,
            blotter_ref: None,
            created_at: now,
            completed_at: None,
            expires_at: now + DEFAULT_WINDOW,
            archive_flag: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of a [`crate::idempotency_store::IdempotencyStore::check`] call.
#[derive(Debug, Clone)]
pub enum IdempotencyCheck {
    HitCompleted { blotter_ref: String },
    HitProcessing,
    Miss,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_processing_and_not_expired() {
        let rec = IdempotencyRecord::new_processing("K1".into(), "T1".into(), "A_B_C".into());
        assert_eq!(rec.status, IdempotencyStatus::Processing);
        assert!(!rec.is_expired(Utc::now()));
        assert!(rec.is_expired(Utc::now() + DEFAULT_WINDOW + Duration::seconds(1)));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            IdempotencyStatus::Processing,
            IdempotencyStatus::Completed,
            IdempotencyStatus::Failed,
        ] {
            assert_eq!(IdempotencyStatus::from_str_opt(s.as_str()), Some(s));
        }
    }
}
