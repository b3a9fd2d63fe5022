//! In-memory Job Registry backend: a `DashMap<jobId, Job>` with no
//! expiry sweep of its own. Suitable for tests and single-instance
//! deployments; [`super::postgres::PostgresJobRegistry`] is the durable
//! equivalent for multi-instance or long-running-batch use.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CancelOutcome, JobRegistry, JobUpdate};
use crate::domain::job::JobStatus;
use crate::domain::trade_request::Source;
use crate::domain::Job;
use crate::error::PstppError;

#[derive(Default)]
pub struct InMemoryJobRegistry {
    jobs: DashMap<String, Job>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRegistry for InMemoryJobRegistry {
    async fn create(
        &self,
        job_id: String,
        trade_id: Option<String>,
        source: Option<Source>,
        callback_url: Option<String>,
    ) -> Result<Job, PstppError> {
        let job = Job::new_pending_full(job_id.clone(), trade_id, source, callback_url);
        self.jobs.insert(job_id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, PstppError> {
        Ok(self.jobs.get(job_id).map(|e| e.value().clone()))
    }

    async fn update(&self, job_id: &str, update: JobUpdate) -> Result<Job, PstppError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PstppError::NotFound(format!("job {job_id}")))?;

        if let Some(status) = update.status {
            entry.transition_to(status).map_err(|(from, to)| PstppError::InvalidStateTransition {
                partition_key: job_id.to_string(),
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            })?;
        }
        if let Some(progress) = update.progress {
            entry.set_progress(progress, update.message.clone());
        } else if update.message.is_some() {
            entry.message = update.message;
        }
        if let Some(result) = update.result {
            entry.result = Some(result);
        }
        if let Some((code, message)) = update.error {
            entry.error_code = Some(code);
            entry.error_message = Some(message);
        }
        entry.updated_at = chrono::Utc::now();
        Ok(entry.clone())
    }

    async fn cancel(&self, job_id: &str) -> Result<CancelOutcome, PstppError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PstppError::NotFound(format!("job {job_id}")))?;
        if entry.status != JobStatus::Pending {
            return Ok(CancelOutcome::NotCancellable);
        }
        entry
            .transition_to(JobStatus::Cancelled)
            .expect("PENDING -> CANCELLED is always a legal transition");
        Ok(CancelOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_registry::shared_tests;

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        shared_tests::create_then_get_roundtrips(&InMemoryJobRegistry::new()).await;
    }

    #[tokio::test]
    async fn update_to_processing_then_completed() {
        shared_tests::update_to_processing_then_completed(&InMemoryJobRegistry::new()).await;
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        shared_tests::illegal_transition_is_rejected(&InMemoryJobRegistry::new()).await;
    }

    #[tokio::test]
    async fn cancel_pending_succeeds_but_not_twice() {
        shared_tests::cancel_pending_succeeds_but_not_twice(&InMemoryJobRegistry::new()).await;
    }

    #[tokio::test]
    async fn cancel_processing_job_is_not_cancellable() {
        shared_tests::cancel_processing_job_is_not_cancellable(&InMemoryJobRegistry::new()).await;
    }
}
