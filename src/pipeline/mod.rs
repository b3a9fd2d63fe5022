//! Processing Pipeline (C5) — the fixed stage graph run under the
//! partition lock for a single request: quick-validate, enrich, rules,
//! deep-validate, state-transition, persist, commit, publish.
//!
//! `Stage` mirrors the capability-interface style used throughout this
//! codebase family (`CacheLock`, `ServiceAdapter`): one `async_trait` method,
//! freely composable, polymorphic over a shared mutable context.

pub mod enrichment;
pub mod rules;
pub mod stages;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

pub use enrichment::{EnrichmentClient, EnrichmentOutcome, NoopEnrichmentClient};
pub use rules::{Rule, RuleAction, RuleGroup, RuleSet};
pub use stages::{
    CommitStage, DeepValidateStage, EnrichStage, PersistBlotterStage, PublishStage, QuickValidateStage,
    RulesStage, StateTransitionStage,
};

use crate::cache_lock::CacheLock;
use crate::commit_store::SequenceAdvance;
use crate::domain::{PositionState, SwapBlotter};
use crate::error::PstppError;

/// Per-request scratch state threaded through every stage. Stages fill in
/// `next_position` (stage 5) for `CommitStage` (stage 7) to act on; the
/// expected-version fields carry the optimistic-concurrency baseline
/// observed when the worker first read the partition/blotter rows.
pub struct PipelineContext {
    pub partition_key: String,
    pub idempotency_key: String,
    pub sequence_number: Option<u64>,
    pub current_position: PositionState,
    pub blotter_expected_version: i64,
    pub partition_expected_version: i64,
    pub next_position: Option<PositionState>,
    /// How `sequence_number` should be applied by `CommitStage`. Set by the
    /// partition dispatcher to `Jump` only for an entry released past a gap
    /// by the Sequence Buffer's `GapPolicy::ReleaseWithWarning`.
    pub sequence_advance: SequenceAdvance,
    /// The partition lock held for this request, if the caller wired one in.
    /// `CommitStage` uses it to verify the lock is still the live holder
    /// before committing (spec.md §4.5: a lost lock must abort, not commit).
    pub lock_cache: Option<Arc<dyn CacheLock>>,
    pub lock_fencing_value: Option<u64>,
}

impl PipelineContext {
    pub fn new(
        partition_key: String,
        idempotency_key: String,
        sequence_number: Option<u64>,
        current_position: PositionState,
        blotter_expected_version: i64,
        partition_expected_version: i64,
    ) -> Self {
        Self {
            partition_key,
            idempotency_key,
            sequence_number,
            current_position,
            blotter_expected_version,
            partition_expected_version,
            next_position: None,
            sequence_advance: SequenceAdvance::Consecutive,
            lock_cache: None,
            lock_fencing_value: None,
        }
    }

    /// Wire in the partition lock so `CommitStage` can verify it is still
    /// held before committing.
    pub fn with_lock(mut self, cache: Arc<dyn CacheLock>, fencing_value: u64) -> Self {
        self.lock_cache = Some(cache);
        self.lock_fencing_value = Some(fencing_value);
        self
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, ctx: &mut PipelineContext, blotter: SwapBlotter) -> Result<SwapBlotter, PstppError>;
}

/// The fixed, ordered stage list. Built once at startup and shared across
/// every partition worker.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Run every stage in order, recording each stage's wall time into the
    /// blotter's `ProcessingMetadata` as it goes (`§4.5`'s canonical order).
    /// A stage's error short-circuits the remaining stages; the caller (the
    /// partition worker) is responsible for classifying it per §4.5's
    /// per-stage failure-policy table.
    pub async fn run(&self, ctx: &mut PipelineContext, mut blotter: SwapBlotter) -> Result<SwapBlotter, PstppError> {
        for stage in &self.stages {
            let start = Instant::now();
            blotter = stage.apply(ctx, blotter).await?;
            blotter.record_timing(stage.name(), start.elapsed().as_millis() as u64);
        }
        Ok(blotter)
    }
}
