//! In-process state store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{Expected, Item, QuotaState, StateStore, Version};
use crate::error::{Result, TollgateError};
use crate::quota::{Clock, SystemClock};

/// A [`StateStore`] kept in a concurrent map.
///
/// Each conditional write runs under the map's per-key shard lock, so the
/// compare and the swap are atomic with respect to other writers of the same
/// key. Expired records are dropped lazily on access or by
/// [`InMemoryStore::purge_expired`].
#[derive(Debug)]
pub struct InMemoryStore {
    records: DashMap<String, Item>,
    next_version: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Create an empty store using the system clock for TTL checks.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that evaluates TTLs against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            next_version: AtomicU64::new(1),
            clock,
        }
    }

    /// Drop every expired record, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.records.len();
        self.records.retain(|_, item| !item.is_expired(now));
        before.saturating_sub(self.records.len())
    }

    /// Number of records held, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn bump_version(&self) -> Version {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn expiry(&self, now: u64, ttl: Duration) -> u64 {
        now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `expected` holds against the record currently stored, if any.
fn precondition_holds(current: Option<&Item>, expected: Expected, now: u64) -> bool {
    let live = current.filter(|item| !item.is_expired(now));
    match (live, expected) {
        (None, Expected::Absent) => true,
        (Some(item), Expected::Version(version)) => item.version == version,
        _ => false,
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Item>> {
        let now = self.clock.now_millis();
        let item = self.records.get(key).map(|entry| entry.value().clone());

        match item {
            Some(item) if item.is_expired(now) => {
                trace!(key = %key, "Dropping expired record");
                self.records
                    .remove_if(key, |_, current| current.version == item.version);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn put(
        &self,
        key: &str,
        state: QuotaState,
        expected: Expected,
        ttl: Duration,
    ) -> Result<Version> {
        let now = self.clock.now_millis();

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if !precondition_holds(Some(entry.get()), expected, now) {
                    return Err(TollgateError::VersionConflict {
                        key: key.to_string(),
                    });
                }
                let version = self.bump_version();
                entry.insert(Item {
                    state,
                    version,
                    expires_at_ms: self.expiry(now, ttl),
                });
                Ok(version)
            }
            Entry::Vacant(entry) => {
                if !precondition_holds(None, expected, now) {
                    return Err(TollgateError::VersionConflict {
                        key: key.to_string(),
                    });
                }
                let version = self.bump_version();
                entry.insert(Item {
                    state,
                    version,
                    expires_at_ms: self.expiry(now, ttl),
                });
                Ok(version)
            }
        }
    }

    async fn delete(&self, key: &str, expected: Expected) -> Result<()> {
        let now = self.clock.now_millis();

        match self.records.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                if !precondition_holds(Some(entry.get()), expected, now) {
                    return Err(TollgateError::VersionConflict {
                        key: key.to_string(),
                    });
                }
                entry.remove();
                Ok(())
            }
            Entry::Vacant(_) => {
                if precondition_holds(None, expected, now) {
                    Ok(())
                } else {
                    Err(TollgateError::VersionConflict {
                        key: key.to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::ManualClock;
    use crate::store::{Bucket, WindowRecord};

    const TTL: Duration = Duration::from_secs(60);

    fn bucket(tokens: u64) -> QuotaState {
        QuotaState::Bucket(Bucket {
            tokens,
            last_refill_ms: 0,
        })
    }

    fn store_at(now: u64) -> (Arc<ManualClock>, InMemoryStore) {
        let clock = Arc::new(ManualClock::new(now));
        let store = InMemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let (_, store) = store_at(0);
        assert!(store.get("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_requires_absent() {
        let (_, store) = store_at(0);

        let version = store.put("k", bucket(5), Expected::Absent, TTL).await.unwrap();
        let item = store.get("k").await.unwrap().unwrap();
        assert_eq!(item.version, version);
        assert_eq!(item.state, bucket(5));

        let err = store.put("k", bucket(4), Expected::Absent, TTL).await.unwrap_err();
        assert!(matches!(err, TollgateError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let (_, store) = store_at(0);
        let first = store.put("k", bucket(5), Expected::Absent, TTL).await.unwrap();
        let second = store
            .put("k", bucket(4), Expected::Version(first), TTL)
            .await
            .unwrap();
        assert_ne!(first, second);

        let err = store
            .put("k", bucket(3), Expected::Version(first), TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::VersionConflict { .. }));
        assert_eq!(store.get("k").await.unwrap().unwrap().state, bucket(4));
    }

    #[tokio::test]
    async fn test_update_of_missing_key_conflicts() {
        let (_, store) = store_at(0);
        let err = store
            .put("k", bucket(1), Expected::Version(7), TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_expired_record_reads_as_absent() {
        let (clock, store) = store_at(0);
        store.put("k", bucket(0), Expected::Absent, TTL).await.unwrap();

        clock.advance(TTL);
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());

        // An expired record no longer blocks a fresh create.
        store.put("k", bucket(9), Expected::Absent, TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().state, bucket(9));
    }

    #[tokio::test]
    async fn test_expired_record_does_not_block_create_before_get() {
        let (clock, store) = store_at(0);
        store.put("k", bucket(0), Expected::Absent, TTL).await.unwrap();
        clock.advance(TTL + Duration::from_secs(1));

        store.put("k", bucket(9), Expected::Absent, TTL).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_delete() {
        let (_, store) = store_at(0);
        let version = store
            .put("w", QuotaState::Window(WindowRecord::open(0)), Expected::Absent, TTL)
            .await
            .unwrap();

        let err = store.delete("w", Expected::Version(version + 1)).await.unwrap_err();
        assert!(matches!(err, TollgateError::VersionConflict { .. }));

        store.delete("w", Expected::Version(version)).await.unwrap();
        assert!(store.get("w").await.unwrap().is_none());

        // Deleting something already gone is fine when absence was expected.
        store.delete("w", Expected::Absent).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, store) = store_at(0);
        store.put("a", bucket(1), Expected::Absent, TTL).await.unwrap();
        store
            .put("b", bucket(1), Expected::Absent, TTL * 2)
            .await
            .unwrap();

        clock.advance(TTL);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[test]
    fn test_blocking_access_from_sync_code() {
        let store = InMemoryStore::new();
        let version =
            tokio_test::block_on(store.put("k", bucket(2), Expected::Absent, TTL)).unwrap();
        let item = tokio_test::block_on(store.get("k")).unwrap().unwrap();
        assert_eq!(item.version, version);
    }
}
