//! `SwapBlotter` — the persisted output artifact of the processing pipeline
//! (C5). One blotter exists per `tradeId`; it accumulates enrichment and
//! rule-evaluation metadata as it moves through the pipeline stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::trade_request::{Source, TradeRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnrichmentStatus {
    Pending,
    Complete,
    Partial,
    Failed,
}

impl std::fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnrichmentStatus::Pending => "PENDING",
            EnrichmentStatus::Complete => "COMPLETE",
            EnrichmentStatus::Partial => "PARTIAL",
            EnrichmentStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Metadata accumulated by the pipeline stages as a blotter is processed;
/// carried alongside the blotter rather than folded into `payload` so every
/// stage can append without re-parsing the CDM body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetadata {
    pub ruleset_version: Option<String>,
    pub applied_rule_ids: Vec<String>,
    pub enrichment_source: Option<String>,
    pub stage_timings_ms: std::collections::BTreeMap<String, u64>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SwapBlotter {
    pub trade_id: String,
    pub partition_key: String,
    pub idempotency_key: String,
    pub source: Source,
    pub payload: serde_json::Value,
    pub enrichment_status: EnrichmentStatus,
    pub metadata: ProcessingMetadata,
    pub version: i64,
    pub archive_flag: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SwapBlotter {
    /// Seed a blotter from its originating request. `version` starts at 0;
    /// the first successful commit bumps it to 1.
    pub fn from_request(req: &TradeRequest) -> Self {
        let now = Utc::now();
        Self {
            trade_id: req.trade_id.clone(),
            partition_key: req.partition_key.clone(),
            idempotency_key: req.idempotency_key.clone(),
            source: req.source,
            payload: req.payload.clone(),
            enrichment_status: EnrichmentStatus::Pending,
            metadata: ProcessingMetadata::default(),
            version: 0,
            archive_flag: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_timing(&mut self, stage: &str, millis: u64) {
        self.metadata
            .stage_timings_ms
            .insert(stage.to_string(), millis);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
