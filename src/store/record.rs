//! Durable quota records as persisted by a [`super::StateStore`].

use serde::{Deserialize, Serialize};

/// Token-bucket state for one client key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Tokens currently available, never above the configured capacity
    pub tokens: u64,
    /// Time of the last credited refill period (epoch millis)
    pub last_refill_ms: u64,
}

/// Fixed-window state for one client key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecord {
    /// When the window was opened (epoch millis)
    pub window_start_ms: u64,
    /// Time of the most recent request in the window (epoch millis)
    pub last_seen_ms: u64,
    /// Requests observed in the window, at least 1
    pub count: u64,
}

impl WindowRecord {
    /// Open a new window at `now_ms` holding a single request.
    pub fn open(now_ms: u64) -> Self {
        Self {
            window_start_ms: now_ms,
            last_seen_ms: now_ms,
            count: 1,
        }
    }
}

/// Whichever record the configured algorithm keeps for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaState {
    Bucket(Bucket),
    Window(WindowRecord),
}

impl QuotaState {
    /// The bucket, if this record belongs to the token-bucket algorithm.
    pub fn as_bucket(&self) -> Option<&Bucket> {
        match self {
            QuotaState::Bucket(bucket) => Some(bucket),
            QuotaState::Window(_) => None,
        }
    }

    /// The window, if this record belongs to the fixed-window algorithm.
    pub fn as_window(&self) -> Option<&WindowRecord> {
        match self {
            QuotaState::Window(window) => Some(window),
            QuotaState::Bucket(_) => None,
        }
    }
}
