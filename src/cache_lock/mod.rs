//! Distributed Cache & Lock (C1).
//!
//! A small capability interface — `setIfAbsent`, `acquire`/`release`/`extend`
//! — with two backends behind it: [`memory::InMemoryCacheLock`] for tests and
//! single-instance deployments, [`postgres::PostgresCacheLock`] for durable,
//! cross-instance locking. Every lock grant carries a fencing value; a caller
//! presenting a stale one is always rejected, never silently ignored.

pub mod memory;
pub mod postgres;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;

pub use memory::InMemoryCacheLock;
pub use postgres::PostgresCacheLock;

use crate::error::PstppError;

/// Default TTL for a lock grant, per spec.md §4.1.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// Initial backoff between `acquire` retries; grows ×1.5 up to
/// [`MAX_RETRY_BACKOFF`].
pub const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(50);
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Proof of ownership over a lock key. `fencing_value` is monotonically
/// increasing per key; every mutation guarded by the lock must present it so
/// a late-arriving holder of a stale token can never win a race against a
/// newer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub fencing_value: u64,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CacheLock: Send + Sync {
    /// Set `key` to `value` only if absent. Returns `true` if this call won
    /// the race and set the value, `false` if it already existed.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, PstppError>;

    async fn get(&self, key: &str) -> Result<Option<String>, PstppError>;

    /// Unconditionally set `key` to `value`, overwriting any live entry.
    /// Unlike `set_if_absent`, callers use this for values that legitimately
    /// transition over time (e.g. the idempotency L1 status cache).
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PstppError>;

    /// Acquire the lock on `key` for `ttl`, blocking with exponential backoff
    /// (50ms ×1.5, capped at 500ms) until `deadline` elapses.
    async fn acquire(&self, key: &str, ttl: Duration, deadline: Duration) -> Result<LockToken, PstppError>;

    /// Release the lock, but only if `token.fencing_value` still matches the
    /// live holder — a stale token is a verified no-op, not best-effort.
    async fn release(&self, token: &LockToken) -> Result<bool, PstppError>;

    /// Extend the TTL of a held lock, CAS-guarded the same way as `release`.
    /// Returns a new token carrying the same fencing value and a later
    /// `expires_at`.
    async fn extend(&self, token: &LockToken, ttl: Duration) -> Result<LockToken, PstppError>;

    /// Current fencing value of the live holder of `key`, or `None` if the
    /// lock is unheld or its lease has expired. Lets a caller that has been
    /// holding a token for a while confirm it is still the live holder
    /// without mutating anything — the `isLocked(key)` capability from
    /// spec.md §4.1.
    async fn is_locked(&self, key: &str) -> Result<Option<u64>, PstppError>;
}

/// Acquire `key` and hand back a [`LockGuard`] instead of a bare token, per
/// design note §9: "every target language offers a deterministic scope-exit
/// mechanism; the lock release MUST live there, not in the happy-path tail."
/// The guard releases on an explicit `release()` call, or — if the caller
/// drops it without calling one, including via an early return or a panic
/// unwind — on `Drop`, via a detached best-effort release task (release is
/// idempotent under fencing, so a redundant attempt is harmless).
pub async fn acquire_scoped(
    cache: Arc<dyn CacheLock>,
    key: &str,
    ttl: Duration,
    wait_timeout: Duration,
) -> Result<LockGuard, PstppError> {
    let token = cache.acquire(key, ttl, wait_timeout).await?;
    Ok(LockGuard {
        cache,
        token,
        released: AtomicBool::new(false),
    })
}

pub struct LockGuard {
    cache: Arc<dyn CacheLock>,
    token: LockToken,
    released: AtomicBool,
}

impl LockGuard {
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn key(&self) -> &str {
        &self.token.key
    }

    /// Extend the hold before the current lease runs out. Workers call this
    /// once they've used up 75% of the remaining TTL, per spec.md §5.
    pub async fn extend(&mut self, ttl: Duration) -> Result<(), PstppError> {
        self.token = self.cache.extend(&self.token, ttl).await?;
        Ok(())
    }

    /// Release ahead of drop. Idempotent: a second call (including the one
    /// `Drop` would otherwise schedule) is a no-op.
    pub async fn release(self) -> Result<bool, PstppError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(true);
        }
        self.cache.release(&self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let cache = self.cache.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let _ = cache.release(&token).await;
        });
    }
}

/// Shared retry loop used by both backends' `acquire` implementation: poll
/// `try_once` with exponential backoff until it succeeds or `deadline`
/// elapses.
pub(crate) async fn acquire_with_retry<F, Fut>(
    key: &str,
    deadline: Duration,
    mut try_once: F,
) -> Result<LockToken, PstppError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<LockToken>, PstppError>>,
{
    let start = tokio::time::Instant::now();
    let mut backoff = INITIAL_RETRY_BACKOFF;
    loop {
        if let Some(token) = try_once().await? {
            return Ok(token);
        }
        if start.elapsed() >= deadline {
            return Err(PstppError::LockAcquisitionFailed {
                key: key.to_string(),
                reason: format!("deadline of {deadline:?} exceeded"),
            });
        }
        // Jitter avoids every waiter on a hot key waking in lockstep.
        let jitter_ms = rand::thread_rng().gen_range(0..=10u64);
        tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
        backoff = std::cmp::min(backoff.mul_f32(1.5), MAX_RETRY_BACKOFF);
    }
}
