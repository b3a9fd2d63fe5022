//! Sequence Buffer (C3) — per-partition reorder buffer for out-of-order
//! upstream sequence numbers.
//!
//! One [`PartitionBuffer`] exists per partition key, scoped to that
//! partition's worker task (never shared across partitions, never locked
//! against concurrent access — the partition dispatcher's one-worker-per-key
//! invariant is what makes that safe). [`SequenceBuffer`] is the registry the
//! dispatcher hands each worker its partition's buffer from.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::config::GapPolicy;
use crate::domain::trade_request::TradeRequest;

/// `(partitionKey, sequenceNumber, enqueuedAt, request)` per spec.md §3,
/// plus the `jobId` the submission path already allocated — carried along so
/// a drain resumes the caller's original job instead of minting a new one.
#[derive(Debug, Clone)]
pub struct SequenceEntry {
    pub sequence_number: u64,
    pub enqueued_at: DateTime<Utc>,
    pub request: TradeRequest,
    pub job_id: String,
}

/// Outcome of [`PartitionBuffer::admit`].
#[derive(Debug)]
pub enum Admission {
    /// No sequence enforcement (request carries no sequence number), or the
    /// request is exactly `expected` — deliver to the pipeline now.
    Deliver(TradeRequest),
    /// `s < expected`: already applied. The idempotency layer typically
    /// catches this first; this is the sequence-layer backstop.
    AlreadyApplied,
    /// `s > expected`: held in the buffer pending its predecessor.
    Buffered,
}

/// Resolution of a hold-deadline sweep over buffered entries with no
/// predecessor in sight.
#[derive(Debug)]
pub enum GapResolution {
    /// Policy (a): release the oldest buffered entry anyway, skipping the
    /// gap, and warn.
    ReleasedWithWarning { request: TradeRequest, job_id: String, skipped_from: u64, skipped_to: u64 },
    /// Policy (b): surface the gap to the operator without releasing.
    StaleGap { partition_key: String, oldest_sequence: u64, age: Duration },
}

/// Per-partition buffer state, keyed by `sequenceNumber`. A `BTreeMap` gives
/// the min-heap behavior the algorithm needs (cheapest next-expected lookup)
/// plus easy iteration for the status API.
#[derive(Default)]
pub struct PartitionBuffer {
    entries: BTreeMap<u64, SequenceEntry>,
}

impl PartitionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admission algorithm from spec.md §4.3, steps 1-3 and 5 (step 4's
    /// drain is [`PartitionBuffer::drain`], called by the caller after the
    /// delivered entry's pipeline run commits). `job_id` is the id the
    /// submission path already allocated for `request`; it travels with a
    /// buffered entry so a later drain resumes the same job.
    pub fn admit(&mut self, request: TradeRequest, job_id: String, last_sequence_number: u64) -> Admission {
        let Some(seq) = request.sequence_number else {
            return Admission::Deliver(request);
        };
        let expected = last_sequence_number + 1;
        if seq < expected {
            return Admission::AlreadyApplied;
        }
        if seq == expected {
            return Admission::Deliver(request);
        }
        self.entries.insert(
            seq,
            SequenceEntry {
                sequence_number: seq,
                enqueued_at: Utc::now(),
                request,
                job_id,
            },
        );
        Admission::Buffered
    }

    /// After `last_sequence_number` advances (a delivered entry's pipeline
    /// run committed), drain any now-consecutive buffered entries in order.
    /// Caller is responsible for running each through the pipeline and
    /// advancing `last_sequence_number` again before calling `drain` again.
    pub fn drain_one_ready(&mut self, last_sequence_number: u64) -> Option<(TradeRequest, String)> {
        let expected = last_sequence_number + 1;
        self.entries.remove(&expected).map(|e| (e.request, e.job_id))
    }

    /// Sweep buffered entries whose hold deadline has elapsed with no
    /// predecessor arriving. Only ever resolves the oldest (lowest sequence)
    /// entry — resolving it may make the next one consecutive.
    pub fn check_expired_hold(
        &mut self,
        partition_key: &str,
        last_sequence_number: u64,
        hold_deadline: Duration,
        policy: GapPolicy,
    ) -> Option<GapResolution> {
        let (&seq, entry) = self.entries.iter().next()?;
        let age = Utc::now().signed_duration_since(entry.enqueued_at);
        let age_std = age.to_std().unwrap_or(Duration::ZERO);
        if age_std < hold_deadline {
            return None;
        }
        match policy {
            GapPolicy::ReleaseWithWarning => {
                let entry = self.entries.remove(&seq)?;
                Some(GapResolution::ReleasedWithWarning {
                    request: entry.request,
                    job_id: entry.job_id,
                    skipped_from: last_sequence_number + 1,
                    skipped_to: seq,
                })
            }
            GapPolicy::StaleGap => Some(GapResolution::StaleGap {
                partition_key: partition_key.to_string(),
                oldest_sequence: seq,
                age: age_std,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest_entry_age(&self) -> Option<Duration> {
        self.entries
            .values()
            .next()
            .map(|e| Utc::now().signed_duration_since(e.enqueued_at).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn gap_set(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }
}

/// Operator-visible snapshot for `/api/v1/backpressure/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SequenceBufferStatus {
    pub partition_key: String,
    pub buffer_size: usize,
    pub oldest_entry_age_ms: Option<u64>,
    pub gap_set: Vec<u64>,
}

/// Registry of per-partition buffers. The dispatcher looks one up (creating
/// it on first sight of a partition) and hands it to that partition's
/// worker for the duration of the worker's run.
#[derive(Default)]
pub struct SequenceBuffer {
    partitions: DashMap<String, Arc<Mutex<PartitionBuffer>>>,
}

impl SequenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, partition_key: &str) -> Arc<Mutex<PartitionBuffer>> {
        self.partitions
            .entry(partition_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PartitionBuffer::new())))
            .clone()
    }

    pub async fn status(&self) -> Vec<SequenceBufferStatus> {
        let mut out = Vec::with_capacity(self.partitions.len());
        for entry in self.partitions.iter() {
            let buf = entry.value().lock().await;
            out.push(SequenceBufferStatus {
                partition_key: entry.key().clone(),
                buffer_size: buf.len(),
                oldest_entry_age_ms: buf.oldest_entry_age().map(|d| d.as_millis() as u64),
                gap_set: buf.gap_set(),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trade_request::Source;

    fn req(trade_id: &str, seq: Option<u64>) -> TradeRequest {
        TradeRequest::new(
            trade_id.into(),
            "A_B_C".into(),
            None,
            seq,
            None,
            Source::Api,
            serde_json::json!({}),
            None,
        )
        .unwrap()
    }

    #[test]
    fn unsequenced_request_delivers_immediately() {
        let mut buf = PartitionBuffer::new();
        assert!(matches!(buf.admit(req("T1", None), "J1".into(), 0), Admission::Deliver(_)));
    }

    #[test]
    fn expected_sequence_delivers_immediately() {
        let mut buf = PartitionBuffer::new();
        assert!(matches!(buf.admit(req("T1", Some(1)), "J1".into(), 0), Admission::Deliver(_)));
    }

    #[test]
    fn late_sequence_is_already_applied() {
        let mut buf = PartitionBuffer::new();
        assert!(matches!(buf.admit(req("T1", Some(1)), "J1".into(), 5), Admission::AlreadyApplied));
    }

    #[test]
    fn gap_sequence_is_buffered_then_drains_in_order() {
        let mut buf = PartitionBuffer::new();
        assert!(matches!(buf.admit(req("T3", Some(3)), "J3".into(), 0), Admission::Buffered));
        assert!(matches!(buf.admit(req("T2", Some(2)), "J2".into(), 0), Admission::Buffered));
        assert_eq!(buf.len(), 2);

        // seq 1 delivered and committed out of band; last_sequence_number -> 1
        let (drained, job_id) = buf.drain_one_ready(1).unwrap();
        assert_eq!(drained.trade_id, "T2");
        assert_eq!(job_id, "J2");
        let (drained, job_id) = buf.drain_one_ready(2).unwrap();
        assert_eq!(drained.trade_id, "T3");
        assert_eq!(job_id, "J3");
        assert!(buf.is_empty());
    }

    #[test]
    fn expired_hold_releases_with_warning_under_default_policy() {
        let mut buf = PartitionBuffer::new();
        buf.admit(req("T5", Some(5)), "J5".into(), 0);
        // Force the entry to look old by constructing it directly in the past.
        let entry = buf.entries.get_mut(&5).unwrap();
        entry.enqueued_at = Utc::now() - chrono::Duration::seconds(31);

        let resolution = buf
            .check_expired_hold("A_B_C", 0, Duration::from_secs(30), GapPolicy::ReleaseWithWarning)
            .unwrap();
        match resolution {
            GapResolution::ReleasedWithWarning { request, job_id, skipped_from, skipped_to } => {
                assert_eq!(request.trade_id, "T5");
                assert_eq!(job_id, "J5");
                assert_eq!(skipped_from, 1);
                assert_eq!(skipped_to, 5);
            }
            other => panic!("expected ReleasedWithWarning, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn expired_hold_under_stale_gap_policy_does_not_release() {
        let mut buf = PartitionBuffer::new();
        buf.admit(req("T5", Some(5)), "J5".into(), 0);
        let entry = buf.entries.get_mut(&5).unwrap();
        entry.enqueued_at = Utc::now() - chrono::Duration::seconds(31);

        let resolution = buf
            .check_expired_hold("A_B_C", 0, Duration::from_secs(30), GapPolicy::StaleGap)
            .unwrap();
        assert!(matches!(resolution, GapResolution::StaleGap { .. }));
        assert_eq!(buf.len(), 1);
    }

    #[tokio::test]
    async fn registry_hands_out_the_same_buffer_for_a_key() {
        let registry = SequenceBuffer::new();
        let a = registry.partition("A_B_C");
        let b = registry.partition("A_B_C");
        a.lock().await.admit(req("T1", Some(1)), "J1".into(), 0);
        assert_eq!(b.lock().await.len(), 0); // seq 1 == expected, delivered not buffered
    }
}
