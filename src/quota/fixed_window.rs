//! Fixed-window algorithm.
//!
//! A window opens at a client's first request and stays open while the
//! client keeps coming back within `idle_timeout`. The observed rate is
//! `(count + 1) / time since the window opened`; reaching `rate_threshold`
//! denies. The window is anchored at first-seen time and never slides, so a
//! burst right after a long quiet stretch inside one window can exceed the
//! intended average.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::store::{QuotaState, WindowRecord};

use super::algorithm::{Evaluation, QuotaAlgorithm, Write};
use super::Decision;

/// Fixed-window parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedWindowConfig {
    /// Requests per second at which clients are denied
    pub rate_threshold: f64,
    /// Seconds of inactivity after which a window is closed
    pub idle_timeout_secs: u64,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self {
            rate_threshold: 5.0,
            idle_timeout_secs: 10,
        }
    }
}

/// Fixed-window quota algorithm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedWindow {
    rate_threshold: f64,
    idle_timeout_ms: u64,
    idle_timeout_secs: u64,
}

impl FixedWindow {
    /// Create the algorithm from validated configuration.
    pub fn new(config: FixedWindowConfig) -> Self {
        Self {
            rate_threshold: config.rate_threshold,
            idle_timeout_ms: config.idle_timeout_secs.saturating_mul(1000),
            idle_timeout_secs: config.idle_timeout_secs,
        }
    }

    /// Requests per second the window would show if one more request landed
    /// at `now_ms`. A window opened this very millisecond has no elapsed time
    /// and reads as an unbounded rate.
    pub fn observed_rate(&self, window: &WindowRecord, now_ms: u64) -> f64 {
        let elapsed_ms = now_ms.saturating_sub(window.window_start_ms);
        if elapsed_ms == 0 {
            return f64::INFINITY;
        }
        (window.count.saturating_add(1)) as f64 / (elapsed_ms as f64 / 1000.0)
    }

    /// Whether the window has been idle longer than the timeout.
    pub fn is_idle(&self, window: &WindowRecord, now_ms: u64) -> bool {
        now_ms.saturating_sub(window.last_seen_ms) > self.idle_timeout_ms
    }
}

impl QuotaAlgorithm for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed_window"
    }

    fn evaluate(&self, current: Option<&QuotaState>, _cost: u64, now_ms: u64) -> Evaluation {
        let Some(window) = current.and_then(QuotaState::as_window) else {
            return Evaluation {
                decision: Decision::Allow,
                write: Write::Put(QuotaState::Window(WindowRecord::open(now_ms))),
            };
        };

        if self.is_idle(window, now_ms) {
            trace!(
                last_seen_ms = window.last_seen_ms,
                count = window.count,
                "Closing idle window"
            );
            return Evaluation {
                decision: Decision::Allow,
                write: Write::Delete,
            };
        }

        let observed = self.observed_rate(window, now_ms);
        let updated = WindowRecord {
            window_start_ms: window.window_start_ms,
            last_seen_ms: window.last_seen_ms.max(now_ms),
            count: window.count.saturating_add(1),
        };

        let decision = if observed >= self.rate_threshold {
            trace!(
                observed_rate = observed,
                threshold = self.rate_threshold,
                "Window rate over threshold"
            );
            Decision::Deny {
                retry_after_secs: self.idle_timeout_secs,
            }
        } else {
            Decision::Allow
        };

        Evaluation {
            decision,
            write: Write::Put(QuotaState::Window(updated)),
        }
    }
}
