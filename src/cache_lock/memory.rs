//! Single-process `CacheLock` backend over a concurrent map. Used in tests
//! and single-instance deployments where there is no cross-instance
//! coordination to durably persist.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{acquire_with_retry, CacheLock, LockToken};
use crate::error::PstppError;

struct Entry {
    value: String,
    fencing_value: u64,
    expires_at: chrono::DateTime<Utc>,
}

pub struct InMemoryCacheLock {
    entries: DashMap<String, Entry>,
    fencing_counter: AtomicU64,
}

impl Default for InMemoryCacheLock {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCacheLock {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            fencing_counter: AtomicU64::new(0),
        }
    }

    fn is_live(entry: &Entry, now: chrono::DateTime<Utc>) -> bool {
        entry.expires_at > now
    }

    fn try_acquire_once(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300));

        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let fencing_value = self.fencing_counter.fetch_add(1, Ordering::SeqCst) + 1;
                v.insert(Entry {
                    value: key.to_string(),
                    fencing_value,
                    expires_at,
                });
                Some(LockToken {
                    key: key.to_string(),
                    fencing_value,
                    expires_at,
                })
            }
            dashmap::mapref::entry::Entry::Occupied(mut o) => {
                if Self::is_live(o.get(), now) {
                    None
                } else {
                    let fencing_value = self.fencing_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    o.insert(Entry {
                        value: key.to_string(),
                        fencing_value,
                        expires_at,
                    });
                    Some(LockToken {
                        key: key.to_string(),
                        fencing_value,
                        expires_at,
                    })
                }
            }
        }
    }
}

#[async_trait]
impl CacheLock for InMemoryCacheLock {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, PstppError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300));
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Entry {
                    value: value.to_string(),
                    fencing_value: self.fencing_counter.fetch_add(1, Ordering::SeqCst) + 1,
                    expires_at,
                });
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Occupied(o) => {
                if Self::is_live(o.get(), now) {
                    Ok(false)
                } else {
                    drop(o);
                    self.entries.insert(
                        key.to_string(),
                        Entry {
                            value: value.to_string(),
                            fencing_value: self.fencing_counter.fetch_add(1, Ordering::SeqCst) + 1,
                            expires_at,
                        },
                    );
                    Ok(true)
                }
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PstppError> {
        let now = Utc::now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| Self::is_live(e, now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PstppError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300));
        let fencing_value = self.fencing_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                fencing_value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn acquire(&self, key: &str, ttl: Duration, deadline: Duration) -> Result<LockToken, PstppError> {
        acquire_with_retry(key, deadline, || async { Ok(self.try_acquire_once(key, ttl)) }).await
    }

    async fn release(&self, token: &LockToken) -> Result<bool, PstppError> {
        match self.entries.entry(token.key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(o) if o.get().fencing_value == token.fencing_value => {
                o.remove();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, token: &LockToken, ttl: Duration) -> Result<LockToken, PstppError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300));
        match self.entries.entry(token.key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut o) if o.get().fencing_value == token.fencing_value => {
                o.get_mut().expires_at = expires_at;
                Ok(LockToken {
                    key: token.key.clone(),
                    fencing_value: token.fencing_value,
                    expires_at,
                })
            }
            _ => Err(PstppError::LockAcquisitionFailed {
                key: token.key.clone(),
                reason: "fencing value stale or lock not held".into(),
            }),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<Option<u64>, PstppError> {
        let now = Utc::now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| Self::is_live(e, now))
            .map(|e| e.fencing_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_then_release_allows_reacquire() {
        let lock = InMemoryCacheLock::new();
        let token = lock
            .acquire("A_B_C", Duration::from_secs(5), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(lock.release(&token).await.unwrap());
        let token2 = lock
            .acquire("A_B_C", Duration::from_secs(5), Duration::from_millis(200))
            .await
            .unwrap();
        assert_ne!(token.fencing_value, token2.fencing_value);
    }

    #[tokio::test]
    async fn second_acquire_fails_within_deadline_while_held() {
        let lock = InMemoryCacheLock::new();
        let _token = lock
            .acquire("A_B_C", Duration::from_secs(5), Duration::from_millis(100))
            .await
            .unwrap();
        let err = lock
            .acquire("A_B_C", Duration::from_secs(5), Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(matches!(err, PstppError::LockAcquisitionFailed { .. }));
    }

    #[tokio::test]
    async fn release_with_stale_fencing_value_is_noop() {
        let lock = InMemoryCacheLock::new();
        let token = lock
            .acquire("A_B_C", Duration::from_secs(5), Duration::from_millis(200))
            .await
            .unwrap();
        let stale = LockToken {
            fencing_value: token.fencing_value + 999,
            ..token.clone()
        };
        assert!(!lock.release(&stale).await.unwrap());
        assert!(lock.release(&token).await.unwrap());
    }

    #[tokio::test]
    async fn set_if_absent_only_wins_once() {
        let lock = InMemoryCacheLock::new();
        assert!(lock.set_if_absent("k", "v1", Duration::from_secs(5)).await.unwrap());
        assert!(!lock.set_if_absent("k", "v2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(lock.get("k").await.unwrap(), Some("v1".to_string()));
    }
}
