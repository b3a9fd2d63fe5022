//! The enrichment stage's external collaborator seam (§1: "enrichment...
//! business logic... modeled as pluggable pipeline stages"). Grounded in
//! `transfer/adapters/mod.rs`'s `ServiceAdapter` shape: a small async trait
//! standing in for an out-of-process dependency, with a trivial in-process
//! implementation for tests and environments with no enrichment service
//! wired up yet.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PstppError;

/// Outcome of an enrichment attempt. `Partial` degrades `enrichmentStatus`
/// without failing the trade (§4.5 step 2); `Failed` only fails the trade
/// when the enrichment client judges a mandatory field absent.
#[derive(Debug, Clone)]
pub enum EnrichmentOutcome {
    Complete { payload: Value, source: String },
    Partial { payload: Value, source: String, warnings: Vec<String> },
    Failed { reason: String },
}

#[async_trait]
pub trait EnrichmentClient: Send + Sync {
    async fn enrich(&self, payload: &Value) -> Result<EnrichmentOutcome, PstppError>;
}

/// Always reports COMPLETE with the payload untouched — the seam a real
/// deployment plugs a reference-data/security-master client into.
pub struct NoopEnrichmentClient;

#[async_trait]
impl EnrichmentClient for NoopEnrichmentClient {
    async fn enrich(&self, payload: &Value) -> Result<EnrichmentOutcome, PstppError> {
        Ok(EnrichmentOutcome::Complete {
            payload: payload.clone(),
            source: "noop".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_client_reports_complete() {
        let client = NoopEnrichmentClient;
        let outcome = client.enrich(&serde_json::json!({"isin": "US0000000000"})).await.unwrap();
        assert!(matches!(outcome, EnrichmentOutcome::Complete { .. }));
    }
}
