//! `Job` — the async submit/poll handle returned to callers of the unified
//! REST surface (§9's adopted resolution: single async submit+poll path, no
//! separate synchronous controller). Backed by the Job Registry (C6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Valid forward transitions for [`Job::transition_to`]: PENDING ->
    /// PROCESSING -> {COMPLETED, FAILED}, and PENDING -> CANCELLED.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub trade_id: Option<String>,
    pub source: Option<crate::domain::trade_request::Source>,
    pub status: JobStatus,
    pub progress: u8,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new_pending(job_id: String, trade_id: Option<String>) -> Self {
        Self::new_pending_full(job_id, trade_id, None, None)
    }

    /// Seed a PENDING job as submitted by an ingress adapter: `source` and
    /// `callback_url` travel with the job so the webhook dispatcher (C8) has
    /// somewhere to deliver the terminal notification without a second
    /// lookup.
    pub fn new_pending_full(
        job_id: String,
        trade_id: Option<String>,
        source: Option<crate::domain::trade_request::Source>,
        callback_url: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            trade_id,
            source,
            status: JobStatus::Pending,
            progress: 0,
            message: None,
            result: None,
            error_code: None,
            error_message: None,
            callback_url,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attempt a state transition, enforcing [`JobStatus::can_transition_to`].
    /// Returns the rejected transition as `(from, to)` on failure so the
    /// caller can build an `INVALID_STATE_TRANSITION` error with context.
    pub fn transition_to(&mut self, next: JobStatus) -> Result<(), (JobStatus, JobStatus)> {
        if !self.status.can_transition_to(next) {
            return Err((self.status, next));
        }
        self.status = next;
        if next.is_terminal() {
            self.progress = 100;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_progress(&mut self, progress: u8, message: Option<String>) {
        self.progress = progress.min(100);
        self.message = message;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, code: &str, message: String) -> Result<(), (JobStatus, JobStatus)> {
        self.transition_to(JobStatus::Failed)?;
        self.error_code = Some(code.to_string());
        self.error_message = Some(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_to_processing_to_completed_succeeds() {
        let mut job = Job::new_pending("J1".into(), Some("T1".into()));
        job.transition_to(JobStatus::Processing).unwrap();
        job.transition_to(JobStatus::Completed).unwrap();
        assert!(job.status.is_terminal());
    }

    #[test]
    fn pending_can_cancel_directly() {
        let mut job = Job::new_pending("J1".into(), None);
        job.transition_to(JobStatus::Cancelled).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn completed_to_processing_is_rejected() {
        let mut job = Job::new_pending("J1".into(), None);
        job.transition_to(JobStatus::Processing).unwrap();
        job.transition_to(JobStatus::Completed).unwrap();
        let err = job.transition_to(JobStatus::Processing).unwrap_err();
        assert_eq!(err, (JobStatus::Completed, JobStatus::Processing));
    }
}
