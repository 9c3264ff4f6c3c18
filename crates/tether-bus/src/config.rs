//! Bus peering configuration.

use std::time::Duration;

/// Tunables for the security coordinator and the delivery pipeline.
///
/// Every field has a conservative default; construct with
/// `BusConfig::default()` and override individual fields as needed.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Upper bound on one complete authentication conversation.
    pub auth_timeout: Duration,

    /// Upper bound on a single peer method call round trip, including
    /// header-expansion fetches.
    pub call_timeout: Duration,

    /// Outbound queue depth per endpoint.
    pub tx_queue_depth: usize,

    /// Longest a sender blocks on a full outbound queue before
    /// rechecking, even when no queued message expires sooner.
    pub tx_wait_cap: Duration,

    /// Capacity of the deferred-work channel feeding the supervisor.
    pub deferred_queue_depth: usize,

    /// Header compression table capacity before LRU eviction.
    pub compression_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
            tx_queue_depth: 10,
            tx_wait_cap: Duration::from_secs(20),
            deferred_queue_depth: 64,
            compression_capacity: 4096,
        }
    }
}
