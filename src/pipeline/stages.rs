//! Concrete stage implementations for the canonical order in spec.md §4.5.
//! Each is the seam a real deployment would plug a richer implementation
//! into; these are runnable end-to-end without external services.

use async_trait::async_trait;
use std::sync::Arc;

use super::{EnrichmentClient, EnrichmentOutcome, PipelineContext, RuleSet, Stage};
use crate::blotter_store::BlotterStore;
use crate::commit_store::CommitStore;
use crate::domain::blotter::EnrichmentStatus;
use crate::domain::SwapBlotter;
use crate::error::PstppError;
use crate::publisher::Publisher;

/// Stage 1 — structural checks named in §4.5: the payload must be a JSON
/// object (the opaque CDM body always is one) and non-empty.
pub struct QuickValidateStage;

#[async_trait]
impl Stage for QuickValidateStage {
    fn name(&self) -> &'static str {
        "quick_validate"
    }

    async fn apply(&self, _ctx: &mut PipelineContext, blotter: SwapBlotter) -> Result<SwapBlotter, PstppError> {
        if !blotter.payload.is_object() {
            return Err(PstppError::Validation(
                "payload must be a structured object".into(),
            ));
        }
        if blotter.payload.as_object().is_some_and(|o| o.is_empty()) {
            return Err(PstppError::Validation("payload must not be empty".into()));
        }
        Ok(blotter)
    }
}

/// Stage 2 — calls an injected [`EnrichmentClient`]. Total failure only
/// fails the trade when the client reports a mandatory field absent
/// (`EnrichmentOutcome::Failed`); a `Partial` outcome degrades
/// `enrichmentStatus` without failing anything.
pub struct EnrichStage {
    client: Arc<dyn EnrichmentClient>,
}

impl EnrichStage {
    pub fn new(client: Arc<dyn EnrichmentClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Stage for EnrichStage {
    fn name(&self) -> &'static str {
        "enrich"
    }

    async fn apply(&self, _ctx: &mut PipelineContext, mut blotter: SwapBlotter) -> Result<SwapBlotter, PstppError> {
        match self.client.enrich(&blotter.payload).await? {
            EnrichmentOutcome::Complete { payload, source } => {
                blotter.payload = payload;
                blotter.enrichment_status = EnrichmentStatus::Complete;
                blotter.metadata.enrichment_source = Some(source);
            }
            EnrichmentOutcome::Partial { payload, source, warnings } => {
                blotter.payload = payload;
                blotter.enrichment_status = EnrichmentStatus::Partial;
                blotter.metadata.enrichment_source = Some(source);
                blotter.metadata.warnings.extend(warnings);
            }
            EnrichmentOutcome::Failed { reason } => {
                blotter.enrichment_status = EnrichmentStatus::Failed;
                return Err(PstppError::EnrichmentFailed(reason));
            }
        }
        Ok(blotter)
    }
}

/// Stage 3 — evaluates the injected [`RuleSet`], recording its version and
/// the matched rule ids into `ProcessingMetadata`.
pub struct RulesStage {
    rules: Arc<RuleSet>,
}

impl RulesStage {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl Stage for RulesStage {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn apply(&self, _ctx: &mut PipelineContext, mut blotter: SwapBlotter) -> Result<SwapBlotter, PstppError> {
        let applied = self.rules.evaluate(&mut blotter);
        blotter.metadata.ruleset_version = Some(self.rules.version.clone());
        blotter.metadata.applied_rule_ids = applied;
        Ok(blotter)
    }
}

/// Stage 4 — business invariants named in §4.5: ISIN format when present,
/// and a `bookOpen` flag (defaulting to open when absent, since most
/// payloads never carry the field).
pub struct DeepValidateStage;

/// Loose ISIN shape check: 2 uppercase letters, 9 alphanumeric, 1 digit.
/// Not a full Luhn-style check-digit validation — the rules/enrichment
/// layer owns the authoritative reference-data check; this is the
/// structural gate named in §4.5.
fn looks_like_isin(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 12
        && bytes[0..2].iter().all(|b| b.is_ascii_uppercase())
        && bytes[2..11].iter().all(|b| b.is_ascii_alphanumeric())
        && bytes[11].is_ascii_digit()
}

#[async_trait]
impl Stage for DeepValidateStage {
    fn name(&self) -> &'static str {
        "deep_validate"
    }

    async fn apply(&self, _ctx: &mut PipelineContext, blotter: SwapBlotter) -> Result<SwapBlotter, PstppError> {
        if let Some(isin) = blotter.payload.get("isin").and_then(|v| v.as_str())
            && !looks_like_isin(isin)
        {
            return Err(PstppError::Validation(format!("malformed ISIN: {isin}")));
        }
        if let Some(book_open) = blotter.payload.get("bookOpen").and_then(|v| v.as_bool())
            && !book_open
        {
            return Err(PstppError::Validation("book is closed".into()));
        }
        Ok(blotter)
    }
}

/// Stage 5 — compute the next `positionState` and stage it on the context
/// for `CommitStage` to apply under the partition's write scope. A payload
/// carrying `"cancel": true` requests early cancellation (valid from any
/// non-terminal state); otherwise the lifecycle advances one step.
pub struct StateTransitionStage;

#[async_trait]
impl Stage for StateTransitionStage {
    fn name(&self) -> &'static str {
        "state_transition"
    }

    async fn apply(&self, ctx: &mut PipelineContext, blotter: SwapBlotter) -> Result<SwapBlotter, PstppError> {
        use crate::domain::PositionState;

        let wants_cancel = blotter.payload.get("cancel").and_then(|v| v.as_bool()).unwrap_or(false);
        let next = if wants_cancel {
            PositionState::Cancelled
        } else {
            match ctx.current_position {
                PositionState::Executed => PositionState::Formed,
                PositionState::Formed => PositionState::Settled,
                PositionState::Settled => PositionState::Closed,
                PositionState::Cancelled | PositionState::Closed => {
                    return Err(PstppError::InvalidStateTransition {
                        partition_key: ctx.partition_key.clone(),
                        from: format!("{:?}", ctx.current_position),
                        to: "ANY".into(),
                    });
                }
            }
        };
        if !ctx.current_position.can_transition_to(next) {
            return Err(PstppError::InvalidStateTransition {
                partition_key: ctx.partition_key.clone(),
                from: format!("{:?}", ctx.current_position),
                to: format!("{next:?}"),
            });
        }
        ctx.next_position = Some(next);
        Ok(blotter)
    }
}

/// Stage 6 — upsert the blotter by `tradeId` under its own optimistic
/// version check. Runs ahead of (and independent from) stage 7's
/// partition-state/idempotency commit.
pub struct PersistBlotterStage {
    blotters: Arc<dyn BlotterStore>,
}

impl PersistBlotterStage {
    pub fn new(blotters: Arc<dyn BlotterStore>) -> Self {
        Self { blotters }
    }
}

#[async_trait]
impl Stage for PersistBlotterStage {
    fn name(&self) -> &'static str {
        "persist_blotter"
    }

    async fn apply(&self, ctx: &mut PipelineContext, blotter: SwapBlotter) -> Result<SwapBlotter, PstppError> {
        self.blotters.upsert(&blotter, ctx.blotter_expected_version).await?;
        Ok(blotter)
    }
}

/// Stage 7 — atomically advance `lastSequenceNumber`, write the staged
/// `positionState`, and mark the idempotency record COMPLETED.
pub struct CommitStage {
    commit: Arc<dyn CommitStore>,
}

impl CommitStage {
    pub fn new(commit: Arc<dyn CommitStore>) -> Self {
        Self { commit }
    }
}

#[async_trait]
impl Stage for CommitStage {
    fn name(&self) -> &'static str {
        "commit"
    }

    async fn apply(&self, ctx: &mut PipelineContext, blotter: SwapBlotter) -> Result<SwapBlotter, PstppError> {
        let next_position = ctx.next_position.ok_or_else(|| {
            PstppError::ProcessingError("commit stage ran before state_transition staged a target state".into())
        })?;

        // Lock loss (token expired) must abort here, not commit — spec.md
        // §4.5's failure table. A verified-stale fencing value means another
        // worker may already be serializing this partition.
        if let (Some(cache), Some(fencing_value)) = (&ctx.lock_cache, ctx.lock_fencing_value) {
            let live = cache.is_locked(&ctx.partition_key).await?;
            if live != Some(fencing_value) {
                return Err(PstppError::LockAcquisitionFailed {
                    key: ctx.partition_key.clone(),
                    reason: "partition lock lost before commit".into(),
                });
            }
        }

        self.commit
            .commit(
                &ctx.partition_key,
                ctx.sequence_number,
                ctx.sequence_advance,
                next_position,
                ctx.partition_expected_version,
                &ctx.idempotency_key,
                &format!("blotter:{}", blotter.trade_id),
            )
            .await?;
        Ok(blotter)
    }
}

/// Stage 8 — hand the blotter to downstream publishers. Publish failures
/// never roll back the commit; they are logged and left to the publisher
/// subsystem's own retry (§4.5 step 8).
pub struct PublishStage {
    publisher: Arc<dyn Publisher>,
}

impl PublishStage {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Stage for PublishStage {
    fn name(&self) -> &'static str {
        "publish"
    }

    async fn apply(&self, ctx: &mut PipelineContext, blotter: SwapBlotter) -> Result<SwapBlotter, PstppError> {
        if let Err(err) = self.publisher.publish(&blotter).await {
            tracing::warn!(
                partition_key = %ctx.partition_key,
                trade_id = %blotter.trade_id,
                error = %err,
                "downstream publish failed; commit already durable, not retried here"
            );
        }
        Ok(blotter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blotter_store::InMemoryBlotterStore;
    use crate::cache_lock::{CacheLock, InMemoryCacheLock};
    use crate::commit_store::InMemoryCommitStore;
    use crate::domain::trade_request::{Source, TradeRequest};
    use crate::domain::PositionState;
    use crate::idempotency_store::{IdempotencyStore, InMemoryIdempotencyRecords};
    use crate::partition_state_store::InMemoryPartitionStateStore;
    use crate::pipeline::{NoopEnrichmentClient, Pipeline};
    use crate::publisher::NullPublisher;
    use std::time::Duration;

    fn request(payload: serde_json::Value) -> TradeRequest {
        TradeRequest::new(
            "T1".into(),
            "A_B_C".into(),
            None,
            Some(1),
            None,
            Source::Api,
            payload,
            None,
        )
        .unwrap()
    }

    async fn build_pipeline() -> (Pipeline, Arc<dyn BlotterStore>, Arc<IdempotencyStore>) {
        let blotters: Arc<dyn BlotterStore> = Arc::new(InMemoryBlotterStore::new());
        let partition_states = Arc::new(InMemoryPartitionStateStore::new());
        let idempotency = Arc::new(IdempotencyStore::new(
            Arc::new(InMemoryCacheLock::new()),
            Arc::new(InMemoryIdempotencyRecords::new()),
            Duration::from_secs(60),
        ));
        let commit: Arc<dyn CommitStore> = Arc::new(InMemoryCommitStore::new(
            partition_states.clone(),
            idempotency.clone(),
        ));
        let pipeline = Pipeline::new(vec![
            Box::new(QuickValidateStage),
            Box::new(EnrichStage::new(Arc::new(NoopEnrichmentClient))),
            Box::new(RulesStage::new(Arc::new(RuleSet::empty("v1")))),
            Box::new(DeepValidateStage),
            Box::new(StateTransitionStage),
            Box::new(PersistBlotterStage::new(blotters.clone())),
            Box::new(CommitStage::new(commit)),
            Box::new(PublishStage::new(Arc::new(NullPublisher))),
        ]);
        (pipeline, blotters, idempotency)
    }

    #[tokio::test]
    async fn full_pipeline_run_commits_blotter_state_and_idempotency() {
        let (pipeline, blotters, idempotency) = build_pipeline().await;
        let req = request(serde_json::json!({"isin": "US0000000001"}));
        idempotency.register(&req).await.unwrap();
        let blotter = SwapBlotter::from_request(&req);
        let mut ctx = PipelineContext::new(
            req.partition_key.clone(),
            req.idempotency_key.clone(),
            req.sequence_number,
            PositionState::Executed,
            0,
            0,
        );
        let result = pipeline.run(&mut ctx, blotter).await.unwrap();
        assert_eq!(result.metadata.ruleset_version.as_deref(), Some("v1"));
        assert!(blotters.find_by_trade_id("T1").await.unwrap().is_some());
        assert!(matches!(
            idempotency.check(&req.idempotency_key).await.unwrap(),
            crate::domain::IdempotencyCheck::HitCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn malformed_isin_fails_at_deep_validate_before_any_commit() {
        let (pipeline, blotters, idempotency) = build_pipeline().await;
        let req = request(serde_json::json!({"isin": "not-an-isin"}));
        idempotency.register(&req).await.unwrap();
        let blotter = SwapBlotter::from_request(&req);
        let mut ctx = PipelineContext::new(
            req.partition_key.clone(),
            req.idempotency_key.clone(),
            req.sequence_number,
            PositionState::Executed,
            0,
            0,
        );
        let err = pipeline.run(&mut ctx, blotter).await.unwrap_err();
        assert!(matches!(err, PstppError::Validation(_)));
        assert!(blotters.find_by_trade_id("T1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_stage_rejects_when_lock_fencing_value_is_stale() {
        let (pipeline, blotters, idempotency) = build_pipeline().await;
        let req = request(serde_json::json!({"isin": "US0000000001"}));
        idempotency.register(&req).await.unwrap();
        let blotter = SwapBlotter::from_request(&req);

        let cache: Arc<dyn CacheLock> = Arc::new(InMemoryCacheLock::new());
        cache
            .acquire(&req.partition_key, Duration::from_secs(5), Duration::from_millis(200))
            .await
            .unwrap();
        // A stale fencing value simulates the lock having expired and been
        // re-acquired (or simply expired) since this worker last held it.
        let stale_fencing_value = 9999;

        let mut ctx = PipelineContext::new(
            req.partition_key.clone(),
            req.idempotency_key.clone(),
            req.sequence_number,
            PositionState::Executed,
            0,
            0,
        )
        .with_lock(cache, stale_fencing_value);

        let err = pipeline.run(&mut ctx, blotter).await.unwrap_err();
        assert!(matches!(err, PstppError::LockAcquisitionFailed { .. }));
        // Stage 6 (persist_blotter) already ran and is independent of stage
        // 7's commit; only the partition-state/idempotency commit is
        // rejected here.
        assert!(blotters.find_by_trade_id("T1").await.unwrap().is_some());
        assert!(matches!(
            idempotency.check(&req.idempotency_key).await.unwrap(),
            crate::domain::IdempotencyCheck::HitProcessing
        ));
    }

    #[tokio::test]
    async fn empty_payload_fails_quick_validate() {
        let (pipeline, _blotters, _idempotency) = build_pipeline().await;
        let req = request(serde_json::json!({}));
        let blotter = SwapBlotter::from_request(&req);
        let mut ctx = PipelineContext::new(
            req.partition_key.clone(),
            req.idempotency_key.clone(),
            req.sequence_number,
            PositionState::Executed,
            0,
            0,
        );
        let err = pipeline.run(&mut ctx, blotter).await.unwrap_err();
        assert!(matches!(err, PstppError::Validation(_)));
    }
}
