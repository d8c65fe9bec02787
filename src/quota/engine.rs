//! Store-backed quota engine.
//!
//! Every decision is a read-evaluate-write cycle against the state store. The
//! write is conditional on the version observed by the read, so two
//! invocations racing on the same key (possibly on different edge nodes)
//! cannot both spend the same tokens: the loser sees a version conflict and
//! runs the whole cycle again on the fresh record.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, trace, warn};

use crate::error::{Result, TollgateError};
use crate::store::{Expected, Item, StateStore};

use super::algorithm::{QuotaAlgorithm, Write};
use super::{ClientKey, Clock, Decision, QuotaPolicy};

/// Attempts per decision before giving up on a contended key.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Upper bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(25);
/// Store-side lifetime of a record after its last write.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Tuning for the engine's store traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Read-evaluate-write cycles attempted before failing open
    pub max_attempts: u32,
    /// Timeout applied to each store call
    pub store_timeout: Duration,
    /// TTL attached to every record written
    pub record_ttl: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            record_ttl: DEFAULT_RECORD_TTL,
        }
    }
}

/// The authoritative quota check.
///
/// Holds no per-client state of its own; everything durable lives in the
/// store, so any number of engines may share one store.
pub struct QuotaEngine<S: StateStore> {
    store: Arc<S>,
    algorithm: Arc<dyn QuotaAlgorithm>,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
}

impl<S: StateStore> QuotaEngine<S> {
    /// Create an engine running `policy` against `store`.
    pub fn new(store: Arc<S>, policy: &QuotaPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            algorithm: policy.algorithm(),
            clock,
            options: EngineOptions::default(),
        }
    }

    /// Replace the store tuning.
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// The store this engine reads and writes.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The active store tuning.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Name of the configured algorithm.
    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }

    /// Decide whether `key` may spend `cost` units of quota.
    ///
    /// Never fails: store outages and persistent write contention resolve
    /// to [`Decision::Allow`] so that an admission-control outage does not
    /// take the protected service down with it.
    #[instrument(skip(self, key), fields(client_key = %key, algorithm = self.algorithm.name()))]
    pub async fn decide(&self, key: &ClientKey, cost: u64) -> Decision {
        match self.try_decide(key, cost).await {
            Ok(decision) => decision,
            Err(TollgateError::VersionConflict { .. }) => {
                warn!(
                    attempts = self.options.max_attempts,
                    "Quota record stayed contended, allowing request"
                );
                Decision::Allow
            }
            Err(e) => {
                warn!(error = %e, "Quota check failed, allowing request");
                Decision::Allow
            }
        }
    }

    /// Decide like [`QuotaEngine::decide`], but report failures instead of
    /// failing open.
    ///
    /// Version conflicts are retried up to `max_attempts` times; a store
    /// failure is returned immediately.
    pub async fn try_decide(&self, key: &ClientKey, cost: u64) -> Result<Decision> {
        let attempts = self.options.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.attempt(key, cost).await {
                Err(TollgateError::VersionConflict { .. }) => {
                    debug!(attempt = attempt, "Lost conditional write, retrying");
                }
                other => return other,
            }
        }

        Err(TollgateError::VersionConflict {
            key: key.to_string(),
        })
    }

    /// One read-evaluate-write cycle.
    async fn attempt(&self, key: &ClientKey, cost: u64) -> Result<Decision> {
        let current = self.bounded(self.store.get(key.as_str())).await?;
        let now = self.clock.now_millis();

        let expected = current.as_ref().map_or(Expected::Absent, Item::expected);
        let evaluation = self
            .algorithm
            .evaluate(current.as_ref().map(|item| &item.state), cost, now);

        match evaluation.write {
            Write::Put(state) => {
                trace!(state = ?state, expected = ?expected, "Writing quota record");
                self.bounded(
                    self.store
                        .put(key.as_str(), state, expected, self.options.record_ttl),
                )
                .await?;
            }
            Write::Delete => {
                trace!(expected = ?expected, "Deleting quota record");
                self.bounded(self.store.delete(key.as_str(), expected))
                    .await?;
            }
        }

        debug!(decision = ?evaluation.decision, "Quota decision made");
        Ok(evaluation.decision)
    }

    /// Apply the store timeout to a store call.
    async fn bounded<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.options.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TollgateError::StoreUnavailable(format!(
                "store call exceeded {:?}",
                self.options.store_timeout
            ))),
        }
    }
}
