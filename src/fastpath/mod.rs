//! Fast-path filter.
//!
//! Runs before the quota engine on every request and never touches the
//! store. A request carrying a valid, unexpired marker is rejected on the
//! spot; anything else (no marker, an expired one, or one that fails to
//! decode) passes through to the authoritative check.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::quota::Clock;

mod marker;

pub use marker::{Marker, MarkerCodec};

/// Outcome of the fast-path check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPath {
    /// Continue to the quota engine.
    Pass,
    /// The client is still blocked by an earlier denial.
    Reject {
        /// Seconds left on the block
        retry_after_secs: u64,
    },
}

/// Stateless marker check.
#[derive(Debug, Clone)]
pub struct FastPathFilter {
    codec: Arc<MarkerCodec>,
    clock: Arc<dyn Clock>,
}

impl FastPathFilter {
    /// Create a filter honouring markers signed by `codec`.
    pub fn new(codec: Arc<MarkerCodec>, clock: Arc<dyn Clock>) -> Self {
        Self { codec, clock }
    }

    /// Check the marker carried by a request, if any.
    ///
    /// Fails open: a marker that cannot be verified is treated as absent.
    pub fn evaluate(&self, marker: Option<&str>) -> FastPath {
        let Some(token) = marker else {
            return FastPath::Pass;
        };

        let marker = match self.codec.decode(token) {
            Ok(marker) => marker,
            Err(e) => {
                debug!(error = %e, "Ignoring unverifiable marker");
                return FastPath::Pass;
            }
        };

        let now = self.clock.now_millis();
        if !marker.is_active(now) {
            trace!(
                blocked_until_ms = marker.blocked_until_ms,
                "Ignoring expired marker"
            );
            return FastPath::Pass;
        }

        let retry_after_secs = marker.remaining_secs(now);
        debug!(retry_after_secs = retry_after_secs, "Rejected on fast path");
        FastPath::Reject { retry_after_secs }
    }
}
