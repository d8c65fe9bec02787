//! Admission coordinator.
//!
//! Composes the two tiers: the fast-path filter first, the quota engine only
//! for requests it lets through. A denial from the engine is turned into a
//! signed marker so the fast path can turn the client away on its next
//! requests without another store round-trip.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TollgateConfig;
use crate::error::Result;
use crate::fastpath::{FastPath, FastPathFilter, MarkerCodec};
use crate::quota::{ClientKey, Clock, Decision, QuotaEngine};
use crate::store::StateStore;

/// HTTP status returned to clients over quota.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
/// Reason phrase for [`STATUS_TOO_MANY_REQUESTS`].
pub const STATUS_TEXT_TOO_MANY_REQUESTS: &str = "Too Many Requests";

/// The parts of an inbound request the coordinator looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Quota subject; requests without one are never rate limited
    pub client_key: Option<ClientKey>,
    /// Marker presented by the client, if any
    pub marker: Option<String>,
    /// Quota units this request costs, 1 when absent
    pub cost: Option<u64>,
}

/// Rejection sent back in place of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectResponse {
    pub status: u16,
    pub status_text: String,
    /// Seconds until the client should try again
    pub retry_after_secs: u64,
    /// Fresh marker to hand to the client, set on engine denials
    pub marker: Option<IssuedMarker>,
}

/// A marker issued on an engine denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedMarker {
    pub token: String,
    /// How long the marker stays valid; at most `max_block_secs`
    pub max_age_secs: u64,
}

impl RejectResponse {
    fn too_many_requests(retry_after_secs: u64, marker: Option<IssuedMarker>) -> Self {
        Self {
            status: STATUS_TOO_MANY_REQUESTS,
            status_text: STATUS_TEXT_TOO_MANY_REQUESTS.to_string(),
            retry_after_secs,
            marker,
        }
    }
}

/// What to do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Pass the original request on unchanged.
    Forward,
    /// Answer with a rejection instead.
    Reject(RejectResponse),
}

impl Admission {
    /// Helper to check if the request goes through.
    pub fn is_forward(&self) -> bool {
        matches!(self, Admission::Forward)
    }
}

/// Runs the fast path, then the quota engine.
pub struct AdmissionCoordinator<S: StateStore> {
    filter: FastPathFilter,
    engine: QuotaEngine<S>,
    codec: Arc<MarkerCodec>,
    clock: Arc<dyn Clock>,
    max_block_secs: u64,
}

impl<S: StateStore> AdmissionCoordinator<S> {
    /// Compose a coordinator from its parts.
    ///
    /// `codec` signs the markers issued on denial; the filter should verify
    /// with the same key.
    pub fn new(
        filter: FastPathFilter,
        engine: QuotaEngine<S>,
        codec: Arc<MarkerCodec>,
        clock: Arc<dyn Clock>,
        max_block_secs: u64,
    ) -> Self {
        Self {
            filter,
            engine,
            codec,
            clock,
            max_block_secs,
        }
    }

    /// Wire a coordinator from configuration.
    pub fn from_config(
        config: &TollgateConfig,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let codec = Arc::new(config.marker.codec()?);
        let filter = FastPathFilter::new(codec.clone(), clock.clone());
        let engine = QuotaEngine::new(store, &config.policy, clock.clone())
            .with_options(config.store.engine_options());

        info!(
            algorithm = engine.algorithm_name(),
            max_attempts = config.store.max_attempts,
            store_timeout_ms = config.store.timeout_ms,
            "Admission coordinator initialized"
        );

        Ok(Self::new(
            filter,
            engine,
            codec,
            clock,
            config.marker.max_block_secs,
        ))
    }

    /// The quota engine behind the fast path.
    pub fn engine(&self) -> &QuotaEngine<S> {
        &self.engine
    }

    /// Fast-path tier only.
    pub fn check_marker(&self, marker: Option<&str>) -> Admission {
        match self.filter.evaluate(marker) {
            FastPath::Pass => Admission::Forward,
            FastPath::Reject { retry_after_secs } => {
                // The client keeps the marker it already holds.
                Admission::Reject(RejectResponse::too_many_requests(retry_after_secs, None))
            }
        }
    }

    /// Quota tier only.
    pub async fn check_quota(&self, key: &ClientKey, cost: u64) -> Admission {
        match self.engine.decide(key, cost).await {
            Decision::Allow => Admission::Forward,
            Decision::Deny { retry_after_secs } => {
                let block_secs = retry_after_secs.clamp(1, self.max_block_secs.max(1));
                let token = self.codec.issue(self.clock.now_millis(), block_secs);
                debug!(
                    client_key = %key,
                    retry_after_secs = retry_after_secs,
                    block_secs = block_secs,
                    "Issuing over-limit marker"
                );
                Admission::Reject(RejectResponse::too_many_requests(
                    retry_after_secs,
                    Some(IssuedMarker {
                        token,
                        max_age_secs: block_secs,
                    }),
                ))
            }
        }
    }

    /// Both tiers, in order.
    pub async fn admit(&self, request: &AdmissionRequest) -> Admission {
        let fast = self.check_marker(request.marker.as_deref());
        if !fast.is_forward() {
            return fast;
        }

        let Some(key) = &request.client_key else {
            return Admission::Forward;
        };

        self.check_quota(key, request.cost.unwrap_or(1).max(1)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;
    use crate::quota::{ManualClock, QuotaPolicy, TokenBucketConfig};
    use crate::store::{Expected, InMemoryStore, Item, QuotaState, Version};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts every store call.
    struct CountingStore {
        inner: InMemoryStore,
        calls: AtomicUsize,
    }

    impl CountingStore {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StateStore for CountingStore {
        async fn get(&self, key: &str) -> crate::error::Result<Option<Item>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn put(
            &self,
            key: &str,
            state: QuotaState,
            expected: Expected,
            ttl: Duration,
        ) -> crate::error::Result<Version> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.put(key, state, expected, ttl).await
        }

        async fn delete(&self, key: &str, expected: Expected) -> crate::error::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(key, expected).await
        }
    }

    struct DownStore;

    #[async_trait]
    impl StateStore for DownStore {
        async fn get(&self, _key: &str) -> crate::error::Result<Option<Item>> {
            Err(TollgateError::StoreUnavailable("timeout".into()))
        }

        async fn put(
            &self,
            _key: &str,
            _state: QuotaState,
            _expected: Expected,
            _ttl: Duration,
        ) -> crate::error::Result<Version> {
            Err(TollgateError::StoreUnavailable("timeout".into()))
        }

        async fn delete(&self, _key: &str, _expected: Expected) -> crate::error::Result<()> {
            Err(TollgateError::StoreUnavailable("timeout".into()))
        }
    }

    fn coordinator<S: StateStore>(
        store: S,
        capacity: u64,
        clock: &Arc<ManualClock>,
    ) -> AdmissionCoordinator<S> {
        let codec = Arc::new(MarkerCodec::new(b"shared-edge-secret").unwrap());
        let policy = QuotaPolicy::TokenBucket(TokenBucketConfig {
            capacity,
            refill_amount: 1,
            refill_interval_secs: 60,
        });
        AdmissionCoordinator::new(
            FastPathFilter::new(codec.clone(), clock.clone()),
            QuotaEngine::new(Arc::new(store), &policy, clock.clone()),
            codec,
            clock.clone(),
            3600,
        )
    }

    fn counting(clock: &Arc<ManualClock>) -> CountingStore {
        CountingStore {
            inner: InMemoryStore::with_clock(clock.clone()),
            calls: AtomicUsize::new(0),
        }
    }

    fn request(key: &str, marker: Option<String>) -> AdmissionRequest {
        AdmissionRequest {
            client_key: Some(ClientKey::new(key)),
            marker,
            cost: None,
        }
    }

    fn expect_reject(admission: Admission) -> RejectResponse {
        match admission {
            Admission::Reject(response) => response,
            Admission::Forward => panic!("expected a rejection"),
        }
    }

    #[tokio::test]
    async fn test_deny_issues_marker_that_short_circuits() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = coordinator(counting(&clock), 1, &clock);

        assert!(gate.admit(&request("k", None)).await.is_forward());

        let rejected = expect_reject(gate.admit(&request("k", None)).await);
        assert_eq!(rejected.status, 429);
        assert_eq!(rejected.status_text, "Too Many Requests");
        assert_eq!(rejected.retry_after_secs, 60);
        let marker = rejected
            .marker
            .expect("engine denial should carry a marker")
            .token;

        // The marker is honoured without touching the store.
        let calls = gate.engine().store().calls();
        let rejected = expect_reject(gate.admit(&request("k", Some(marker))).await);
        assert_eq!(gate.engine().store().calls(), calls);
        assert_eq!(rejected.retry_after_secs, 60);
        assert!(rejected.marker.is_none());
    }

    #[tokio::test]
    async fn test_expired_marker_reaches_engine() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = coordinator(counting(&clock), 1, &clock);

        gate.admit(&request("k", None)).await;
        let marker = expect_reject(gate.admit(&request("k", None)).await)
            .marker
            .map(|issued| issued.token);

        clock.advance(Duration::from_secs(60));
        let calls = gate.engine().store().calls();
        assert!(gate.admit(&request("k", marker)).await.is_forward());
        assert!(gate.engine().store().calls() > calls);
    }

    #[tokio::test]
    async fn test_invalid_marker_is_ignored() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = coordinator(counting(&clock), 5, &clock);

        let admission = gate.admit(&request("k", Some("true".into()))).await;
        assert!(admission.is_forward());
        assert_eq!(gate.engine().store().calls(), 2);
    }

    #[tokio::test]
    async fn test_request_without_key_is_forwarded() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = coordinator(counting(&clock), 1, &clock);

        for _ in 0..5 {
            assert!(gate.admit(&AdmissionRequest::default()).await.is_forward());
        }
        assert_eq!(gate.engine().store().calls(), 0);
    }

    #[tokio::test]
    async fn test_marker_applies_even_without_key() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = coordinator(counting(&clock), 1, &clock);
        let marker = gate.codec.issue(0, 30);

        let admission = gate
            .admit(&AdmissionRequest {
                client_key: None,
                marker: Some(marker),
                cost: None,
            })
            .await;
        assert_eq!(expect_reject(admission).retry_after_secs, 30);
    }

    #[tokio::test]
    async fn test_cost_hint_is_charged() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = coordinator(counting(&clock), 10, &clock);

        let heavy = AdmissionRequest {
            cost: Some(8),
            ..request("k", None)
        };
        assert!(gate.admit(&heavy).await.is_forward());
        assert!(!gate.admit(&heavy).await.is_forward());

        // A zero cost still counts as one request.
        let free = AdmissionRequest {
            cost: Some(0),
            ..request("k", None)
        };
        assert!(gate.admit(&free).await.is_forward());
        assert!(gate.admit(&free).await.is_forward());
        assert!(!gate.admit(&free).await.is_forward());
    }

    #[tokio::test]
    async fn test_store_outage_forwards() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = coordinator(DownStore, 1, &clock);

        for _ in 0..3 {
            assert!(gate.admit(&request("k", None)).await.is_forward());
        }
    }

    #[tokio::test]
    async fn test_marker_lifetime_is_capped() {
        let clock = Arc::new(ManualClock::new(0));
        let codec = Arc::new(MarkerCodec::new(b"k").unwrap());
        let policy = QuotaPolicy::TokenBucket(TokenBucketConfig {
            capacity: 1,
            refill_amount: 1,
            refill_interval_secs: 7_200,
        });
        let gate = AdmissionCoordinator::new(
            FastPathFilter::new(codec.clone(), clock.clone()),
            QuotaEngine::new(
                Arc::new(InMemoryStore::with_clock(clock.clone())),
                &policy,
                clock.clone(),
            ),
            codec.clone(),
            clock.clone(),
            600,
        );

        gate.admit(&request("k", None)).await;
        let rejected = expect_reject(gate.admit(&request("k", None)).await);
        assert_eq!(rejected.retry_after_secs, 7_200);

        let issued = rejected.marker.unwrap();
        assert_eq!(issued.max_age_secs, 600);
        let marker = codec.decode(&issued.token).unwrap();
        assert_eq!(marker.blocked_until_ms, 600_000);
    }

    #[tokio::test]
    async fn test_from_config() {
        let clock = Arc::new(ManualClock::new(0));
        let config = TollgateConfig::default();
        let gate = AdmissionCoordinator::from_config(
            &config,
            Arc::new(InMemoryStore::with_clock(clock.clone())),
            clock.clone(),
        )
        .unwrap();

        assert_eq!(gate.engine().algorithm_name(), "token_bucket");
        for _ in 0..10 {
            assert!(gate.admit(&request("k", None)).await.is_forward());
        }
        assert!(!gate.admit(&request("k", None)).await.is_forward());
    }
}
