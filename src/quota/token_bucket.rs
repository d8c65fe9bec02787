//! Token-bucket algorithm.
//!
//! A bucket starts full and each request removes `cost` tokens. Tokens come
//! back in whole periods: every `refill_interval` credits `refill_amount`
//! tokens, up to `capacity`. Refill is computed lazily from `last_refill`
//! when the client next shows up, so idle clients cost nothing.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::store::{Bucket, QuotaState};

use super::algorithm::{Evaluation, QuotaAlgorithm, Write};
use super::Decision;

/// Token-bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Maximum tokens a bucket can hold
    pub capacity: u64,
    /// Tokens credited per elapsed interval
    pub refill_amount: u64,
    /// Length of a refill interval in seconds
    pub refill_interval_secs: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_amount: 1,
            refill_interval_secs: 60,
        }
    }
}

/// Token-bucket quota algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucket {
    capacity: u64,
    refill_amount: u64,
    refill_interval_ms: u64,
}

impl TokenBucket {
    /// Create the algorithm from validated configuration.
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_amount: config.refill_amount,
            refill_interval_ms: config.refill_interval_secs.saturating_mul(1000).max(1),
        }
    }

    /// The bucket a never-seen client starts with.
    pub fn full(&self, now_ms: u64) -> Bucket {
        Bucket {
            tokens: self.capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Credit every whole interval elapsed since `last_refill`.
    ///
    /// A `last_refill` in the future (clock skew between nodes) counts as no
    /// elapsed time. Reaching capacity restarts the interval at `now_ms` so a
    /// long idle period cannot bank partial credit.
    pub fn refill(&self, bucket: Bucket, now_ms: u64) -> Bucket {
        let elapsed = now_ms.saturating_sub(bucket.last_refill_ms);
        let periods = elapsed / self.refill_interval_ms;

        let credited = bucket
            .tokens
            .saturating_add(periods.saturating_mul(self.refill_amount));
        let mut last_refill_ms = bucket
            .last_refill_ms
            .saturating_add(periods.saturating_mul(self.refill_interval_ms));

        let tokens = if credited >= self.capacity {
            last_refill_ms = last_refill_ms.max(now_ms);
            self.capacity
        } else {
            credited
        };

        Bucket {
            tokens,
            last_refill_ms,
        }
    }

    /// Refill, then try to take `cost` tokens.
    pub fn take(&self, bucket: Bucket, cost: u64, now_ms: u64) -> (Bucket, Decision) {
        let mut bucket = self.refill(bucket, now_ms);

        if bucket.tokens < cost {
            let into_interval = now_ms.saturating_sub(bucket.last_refill_ms);
            let wait_ms = self.refill_interval_ms.saturating_sub(into_interval);
            let retry_after_secs = wait_ms.div_ceil(1000).max(1);

            trace!(
                tokens = bucket.tokens,
                cost = cost,
                retry_after_secs = retry_after_secs,
                "Not enough tokens in bucket"
            );
            return (bucket, Decision::Deny { retry_after_secs });
        }

        bucket.tokens -= cost;
        (bucket, Decision::Allow)
    }
}

impl QuotaAlgorithm for TokenBucket {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn evaluate(&self, current: Option<&QuotaState>, cost: u64, now_ms: u64) -> Evaluation {
        let bucket = current
            .and_then(QuotaState::as_bucket)
            .copied()
            .unwrap_or_else(|| self.full(now_ms));

        // Denials still persist the refill so the next request starts from it.
        let (bucket, decision) = self.take(bucket, cost, now_ms);
        Evaluation {
            decision,
            write: Write::Put(QuotaState::Bucket(bucket)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60_000;

    fn limiter(capacity: u64, refill_amount: u64, refill_interval_secs: u64) -> TokenBucket {
        TokenBucket::new(TokenBucketConfig {
            capacity,
            refill_amount,
            refill_interval_secs,
        })
    }

    fn bucket(tokens: u64, last_refill_ms: u64) -> Bucket {
        Bucket {
            tokens,
            last_refill_ms,
        }
    }

    #[test]
    fn test_fresh_bucket_is_full() {
        let tb = limiter(10, 1, 60);
        let eval = tb.evaluate(None, 1, 5_000);
        assert_eq!(eval.decision, Decision::Allow);
        assert_eq!(eval.write, Write::Put(QuotaState::Bucket(bucket(9, 5_000))));
    }

    #[test]
    fn test_burst_then_refill() {
        let tb = limiter(10, 1, 60);
        let mut state = tb.full(0);

        for i in 0..10 {
            let (next, decision) = tb.take(state, 1, 0);
            assert_eq!(decision, Decision::Allow, "request {} should pass", i + 1);
            state = next;
        }
        assert_eq!(state.tokens, 0);

        let (state, decision) = tb.take(state, 1, 0);
        assert_eq!(decision, Decision::Deny { retry_after_secs: 60 });

        let (state, decision) = tb.take(state, 1, MINUTE);
        assert_eq!(decision, Decision::Allow);
        assert_eq!(state.tokens, 0);
        assert_eq!(state.last_refill_ms, MINUTE);
    }

    #[test]
    fn test_refill_credits_whole_periods() {
        let tb = limiter(100, 3, 60);
        let start = bucket(10, 0);

        let refilled = tb.refill(start, 4 * MINUTE + 59_999);
        assert_eq!(refilled.tokens, 22);
        assert_eq!(refilled.last_refill_ms, 4 * MINUTE);

        // Partial intervals carry over rather than being lost.
        let refilled = tb.refill(refilled, 5 * MINUTE);
        assert_eq!(refilled.tokens, 25);
    }

    #[test]
    fn test_refill_clamps_and_restarts_interval() {
        let tb = limiter(10, 1, 60);
        let refilled = tb.refill(bucket(8, 0), 30 * MINUTE + 1_234);
        assert_eq!(refilled.tokens, 10);
        assert_eq!(refilled.last_refill_ms, 30 * MINUTE + 1_234);
    }

    #[test]
    fn test_last_refill_in_future_is_not_negative_time() {
        let tb = limiter(10, 1, 60);
        let ahead = bucket(2, 10 * MINUTE);

        let refilled = tb.refill(ahead, 5 * MINUTE);
        assert_eq!(refilled, ahead);

        let (_, decision) = tb.take(bucket(0, 10 * MINUTE), 1, 5 * MINUTE);
        assert_eq!(decision, Decision::Deny { retry_after_secs: 60 });
    }

    #[test]
    fn test_full_bucket_does_not_move_refill_backwards() {
        let tb = limiter(10, 1, 60);
        let refilled = tb.refill(bucket(10, 10 * MINUTE), 5 * MINUTE);
        assert_eq!(refilled.last_refill_ms, 10 * MINUTE);
    }

    #[test]
    fn test_cost_above_capacity_always_denies() {
        let tb = limiter(5, 5, 1);
        let (_, decision) = tb.take(tb.full(0), 6, 0);
        assert!(!decision.is_allowed());

        let (_, decision) = tb.take(tb.full(0), 6, 365 * 24 * 3_600_000);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_deny_persists_refill_without_deduction() {
        let tb = limiter(10, 1, 60);
        let eval = tb.evaluate(
            Some(&QuotaState::Bucket(bucket(0, 0))),
            2,
            MINUTE + 15_000,
        );
        assert_eq!(eval.decision, Decision::Deny { retry_after_secs: 45 });
        assert_eq!(eval.write, Write::Put(QuotaState::Bucket(bucket(1, MINUTE))));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let tb = limiter(1, 1, 60);
        let (_, decision) = tb.take(bucket(0, 0), 1, 59_500);
        assert_eq!(decision, Decision::Deny { retry_after_secs: 1 });
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let tb = limiter(4, 3, 1);
        let mut state = tb.full(0);
        let mut now = 0;

        for step in 0..200u64 {
            now += (step * 37) % 1_700;
            let cost = 1 + step % 3;
            let (next, _) = tb.take(state, cost, now);
            assert!(next.tokens <= 4);
            assert!(next.last_refill_ms >= state.last_refill_ms);
            state = next;
        }
    }

    #[test]
    fn test_window_record_reads_as_fresh_bucket() {
        let tb = limiter(3, 1, 60);
        let foreign = QuotaState::Window(crate::store::WindowRecord::open(0));
        let eval = tb.evaluate(Some(&foreign), 1, 100);
        assert_eq!(eval.decision, Decision::Allow);
        assert_eq!(eval.write, Write::Put(QuotaState::Bucket(bucket(2, 100))));
    }
}
