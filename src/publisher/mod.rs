//! Downstream publish transport (§1: "republishes the result to downstream
//! subscribers" is an external-collaborator contract; this crate supplies
//! one concrete implementation of it).
//!
//! `Publisher` is the seam stage 8 ([`crate::pipeline::stages::PublishStage`])
//! calls into. [`NullPublisher`] is the no-op used by tests and any
//! deployment that hasn't wired a transport yet; [`websocket::WsPublisher`]
//! is a best-effort, at-least-once WebSocket broadcast fan-out, grounded in
//! the teacher's `websocket::ConnectionManager` registry-of-senders pattern
//! generalized from per-user delivery to per-partition topic delivery.

pub mod websocket;

use async_trait::async_trait;

pub use websocket::{PublishedBlotter, WsPublisher};

use crate::domain::SwapBlotter;
use crate::error::PstppError;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, blotter: &SwapBlotter) -> Result<(), PstppError>;
}

/// Discards every publish. Used in tests and wherever no downstream
/// transport has been configured — publish failures never affect job
/// outcome (§4.5 step 8), so "no subscribers" is a legitimate steady state.
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, _blotter: &SwapBlotter) -> Result<(), PstppError> {
        Ok(())
    }
}
