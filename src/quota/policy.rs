//! Quota policy selection.
//!
//! Exactly one algorithm is active per deployment. The policy is read from
//! configuration in the form
//!
//! ```yaml
//! algorithm: token_bucket
//! capacity: 10
//! refill_amount: 1
//! refill_interval_secs: 60
//! ```
//!
//! or
//!
//! ```yaml
//! algorithm: fixed_window
//! rate_threshold: 5.0
//! idle_timeout_secs: 10
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

use super::algorithm::QuotaAlgorithm;
use super::fixed_window::{FixedWindow, FixedWindowConfig};
use super::token_bucket::{TokenBucket, TokenBucketConfig};

/// The configured quota algorithm and its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum QuotaPolicy {
    TokenBucket(TokenBucketConfig),
    FixedWindow(FixedWindowConfig),
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        QuotaPolicy::TokenBucket(TokenBucketConfig::default())
    }
}

impl QuotaPolicy {
    /// Parse a policy from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let policy: QuotaPolicy = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse quota policy: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Reject parameters the algorithms cannot work with.
    pub fn validate(&self) -> Result<()> {
        match self {
            QuotaPolicy::TokenBucket(tb) => {
                if tb.capacity == 0 {
                    return Err(TollgateError::Config("capacity must be positive".into()));
                }
                if tb.refill_amount == 0 {
                    return Err(TollgateError::Config("refill_amount must be positive".into()));
                }
                if tb.refill_interval_secs == 0 {
                    return Err(TollgateError::Config(
                        "refill_interval_secs must be positive".into(),
                    ));
                }
            }
            QuotaPolicy::FixedWindow(fw) => {
                if !fw.rate_threshold.is_finite() || fw.rate_threshold <= 0.0 {
                    return Err(TollgateError::Config(
                        "rate_threshold must be a positive number".into(),
                    ));
                }
                if fw.idle_timeout_secs == 0 {
                    return Err(TollgateError::Config(
                        "idle_timeout_secs must be positive".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Build the algorithm this policy selects.
    pub fn algorithm(&self) -> Arc<dyn QuotaAlgorithm> {
        match *self {
            QuotaPolicy::TokenBucket(config) => Arc::new(TokenBucket::new(config)),
            QuotaPolicy::FixedWindow(config) => Arc::new(FixedWindow::new(config)),
        }
    }
}
