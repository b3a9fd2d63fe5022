//! Durable home for the pipeline's output artifact — the `swap_blotter`
//! table named in spec.md §6. Upsert is optimistic-version-checked the same
//! way [`crate::partition_state_store`] is: the caller presents the version
//! it last observed, and a mismatch means someone else committed first.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

pub use memory::InMemoryBlotterStore;
pub use postgres::PostgresBlotterStore;

use crate::domain::SwapBlotter;
use crate::error::PstppError;

#[async_trait]
pub trait BlotterStore: Send + Sync {
    /// Upsert `blotter` by `trade_id`. `expected_version` must match the
    /// currently-stored version (0 for a brand-new trade_id, since a fresh
    /// row is implicitly "version -1" from the caller's perspective only on
    /// first insert — callers always pass the version they last observed,
    /// defaulting to 0 for a blotter that has never been persisted).
    async fn upsert(&self, blotter: &SwapBlotter, expected_version: i64) -> Result<(), PstppError>;

    async fn find_by_trade_id(&self, trade_id: &str) -> Result<Option<SwapBlotter>, PstppError>;
}
