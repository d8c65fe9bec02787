//! State store protocol.
//!
//! The quota engine never holds records across requests; every decision
//! reads the current [`Item`] and writes back conditionally on the version it
//! observed. Whatever backs the store (a replicated table, a cache cluster or
//! the in-process [`InMemoryStore`]) only has to honour the version
//! preconditions below.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

mod memory;
mod record;

pub use memory::InMemoryStore;
pub use record::{Bucket, QuotaState, WindowRecord};

/// Store-assigned record version, changed by every successful write.
pub type Version = u64;

/// Precondition attached to a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// No live record may exist for the key.
    Absent,
    /// The live record must still carry this version.
    Version(Version),
}

/// A record read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub state: QuotaState,
    pub version: Version,
    /// Store-side expiry (epoch millis); expired items read as absent
    pub expires_at_ms: u64,
}

impl Item {
    /// The precondition that only holds while this item is unchanged.
    pub fn expected(&self) -> Expected {
        Expected::Version(self.version)
    }

    /// Whether the store-side TTL has elapsed at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Conditional key/value store for quota records.
///
/// Writes that fail their precondition return
/// [`crate::error::TollgateError::VersionConflict`]; transport failures return
/// [`crate::error::TollgateError::StoreUnavailable`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the live record for `key`.
    async fn get(&self, key: &str) -> Result<Option<Item>>;

    /// Write `state` if `expected` holds, returning the new version.
    async fn put(
        &self,
        key: &str,
        state: QuotaState,
        expected: Expected,
        ttl: Duration,
    ) -> Result<Version>;

    /// Remove the record if `expected` holds.
    async fn delete(&self, key: &str, expected: Expected) -> Result<()>;
}
