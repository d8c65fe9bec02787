//! Quota algorithm trait shared by the token-bucket and fixed-window policies.

use crate::store::QuotaState;

use super::Decision;

/// What the engine must write back after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    /// Store the new record.
    Put(QuotaState),
    /// Remove the record.
    Delete,
}

/// The result of applying an algorithm to the current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    pub write: Write,
}

/// Trait for quota algorithms.
///
/// Implementations are pure: they see the record read from the store (if
/// any) and the current time, and describe the write that makes their
/// decision durable. The engine owns all store traffic and retries.
pub trait QuotaAlgorithm: Send + Sync + std::fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Decide on a request costing `cost` at `now_ms`.
    ///
    /// A record written by a different algorithm is treated as absent.
    fn evaluate(&self, current: Option<&QuotaState>, cost: u64, now_ms: u64) -> Evaluation;
}
