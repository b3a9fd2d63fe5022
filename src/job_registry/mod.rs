//! Job Registry (C6) — async job lifecycle tracking for the unified
//! submit/poll REST surface.
//!
//! Cache-backed with TTL, same as the idempotency store's L1 tier; unlike
//! idempotency, the registry's primary storage IS the cache — there is no
//! required durable tier since a job is a disposable tracking record, not
//! the system of record (the blotter is). [`postgres::PostgresJobRegistry`]
//! exists for deployments that want long-running batch jobs (uploads)
//! to survive a restart; [`memory::InMemoryJobRegistry`] is the
//! cache-only version for everything else.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

pub use memory::InMemoryJobRegistry;
pub use postgres::PostgresJobRegistry;

use crate::domain::job::JobStatus;
use crate::domain::trade_request::Source;
use crate::domain::Job;
use crate::error::PstppError;

/// Outcome of a terminal or progress update applied to a job, used by the
/// dispatcher to decide whether a webhook fires.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<(String, String)>,
}

impl JobUpdate {
    pub fn progress(pct: u8, message: impl Into<String>) -> Self {
        Self {
            status: None,
            progress: Some(pct),
            message: Some(message.into()),
            result: None,
            error: None,
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            message: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            progress: None,
            message: None,
            result: None,
            error: Some((code.into(), message.into())),
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Result of [`JobRegistry::cancel`]: PENDING → CANCELLED is the only
/// cancellable transition per spec.md §4.6; anything else reports
/// `NotCancellable` rather than an error — it's an expected outcome, not a
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotCancellable,
}

#[async_trait]
pub trait JobRegistry: Send + Sync {
    async fn create(
        &self,
        job_id: String,
        trade_id: Option<String>,
        source: Option<Source>,
        callback_url: Option<String>,
    ) -> Result<Job, PstppError>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>, PstppError>;

    /// Apply `update` to the job's current state, enforcing
    /// [`crate::domain::job::JobStatus::can_transition_to`] when a status
    /// change is requested. An attempted illegal transition surfaces as
    /// `PstppError::InvalidStateTransition` using the job id as the
    /// partition-key slot (the job registry has no partition key of its
    /// own, and this keeps one error shape across the crate).
    async fn update(&self, job_id: &str, update: JobUpdate) -> Result<Job, PstppError>;

    /// Cancel iff the job is PENDING; any other state reports
    /// `NotCancellable` without mutating the job.
    async fn cancel(&self, job_id: &str) -> Result<CancelOutcome, PstppError>;
}

#[cfg(test)]
pub(crate) mod shared_tests {
    //! Exercised against both backends from their own test modules via
    //! `super::shared_tests::*` so the contract stays in one place.
    use super::*;

    pub async fn create_then_get_roundtrips(registry: &dyn JobRegistry) {
        let job = registry
            .create("J1".into(), Some("T1".into()), Some(Source::Api), None)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let fetched = registry.get("J1").await.unwrap().unwrap();
        assert_eq!(fetched.job_id, "J1");
    }

    pub async fn update_to_processing_then_completed(registry: &dyn JobRegistry) {
        registry.create("J2".into(), None, None, None).await.unwrap();
        let job = registry
            .update(
                "J2",
                JobUpdate {
                    status: Some(JobStatus::Processing),
                    progress: Some(10),
                    message: Some("started".into()),
                    result: None,
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        let job = registry
            .update("J2", JobUpdate::completed(serde_json::json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
    }

    pub async fn illegal_transition_is_rejected(registry: &dyn JobRegistry) {
        registry.create("J3".into(), None, None, None).await.unwrap();
        registry
            .update("J3", JobUpdate::progress(10, "started").with_status(JobStatus::Processing))
            .await
            .unwrap();
        registry
            .update("J3", JobUpdate::completed(serde_json::json!({})))
            .await
            .unwrap();
        let err = registry
            .update("J3", JobUpdate::progress(50, "retry").with_status(JobStatus::Processing))
            .await
            .unwrap_err();
        assert!(matches!(err, PstppError::InvalidStateTransition { .. }));
    }

    pub async fn cancel_pending_succeeds_but_not_twice(registry: &dyn JobRegistry) {
        registry.create("J4".into(), None, None, None).await.unwrap();
        assert_eq!(registry.cancel("J4").await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(registry.cancel("J4").await.unwrap(), CancelOutcome::NotCancellable);
    }

    pub async fn cancel_processing_job_is_not_cancellable(registry: &dyn JobRegistry) {
        registry.create("J5".into(), None, None, None).await.unwrap();
        registry
            .update("J5", JobUpdate { status: Some(JobStatus::Processing), progress: None, message: None, result: None, error: None })
            .await
            .unwrap();
        assert_eq!(registry.cancel("J5").await.unwrap(), CancelOutcome::NotCancellable);
    }
}
