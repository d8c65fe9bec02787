//! The outcome of a quota check.

use serde::{Deserialize, Serialize};

/// Whether a request may proceed.
///
/// An exhausted quota is an ordinary value here, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The request is within quota.
    Allow,
    /// The client is over quota and should retry later.
    Deny {
        /// Seconds until the client is expected to have quota again
        retry_after_secs: u64,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// The retry hint of a denial.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allow => None,
            Decision::Deny { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_helpers() {
        assert!(Decision::Allow.is_allowed());
        assert_eq!(Decision::Allow.retry_after_secs(), None);

        let deny = Decision::Deny { retry_after_secs: 60 };
        assert!(!deny.is_allowed());
        assert_eq!(deny.retry_after_secs(), Some(60));
    }
}
