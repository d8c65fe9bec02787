//! Quota algorithms and the store-backed engine that runs them.

mod algorithm;
mod clock;
mod decision;
mod engine;
mod fixed_window;
mod key;
mod policy;
mod token_bucket;

pub use algorithm::{Evaluation, QuotaAlgorithm, Write};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::Decision;
pub use engine::{
    EngineOptions, QuotaEngine, DEFAULT_MAX_ATTEMPTS, DEFAULT_RECORD_TTL, DEFAULT_STORE_TIMEOUT,
};
pub use fixed_window::{FixedWindow, FixedWindowConfig};
pub use key::ClientKey;
pub use policy::QuotaPolicy;
pub use token_bucket::{TokenBucket, TokenBucketConfig};
