//! Core data model for the trade capture pipeline.
//!
//! - [`trade_request`] - the canonical inbound request produced by ingress adapters
//! - [`blotter`] - the persisted output artifact (`SwapBlotter`)
//! - [`partition_state`] - per-partition sequence/lifecycle tracking
//! - [`idempotency`] - dedupe record shape
//! - [`job`] - async job lifecycle

pub mod blotter;
pub mod idempotency;
pub mod job;
pub mod partition_state;
pub mod trade_request;

pub use blotter::{EnrichmentStatus, ProcessingMetadata, SwapBlotter};
pub use idempotency::{IdempotencyCheck, IdempotencyRecord, IdempotencyStatus};
pub use job::{Job, JobStatus};
pub use partition_state::{PartitionState, PositionState};
pub use trade_request::{Source, TradeRequest};
