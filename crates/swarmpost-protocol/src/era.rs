//! Network eras -- versioned parameter sets the client shares with the storage network.
//!
//! An era collects every protocol-level constant the nodes enforce (minimum
//! swarm size, clock drift tolerance, message size) together with the client
//! timing defaults tuned for it. User-facing overrides live in the client
//! config; these are the fallbacks.

/// A network era: a named, versioned set of timing and protocol parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkEra {
    /// Era identifier. Monotonically increasing.
    pub id: u16,

    // -- Swarms --
    /// Fewer nodes than this and a swarm is refreshed before use.
    pub min_swarm_size: usize,
    /// Consecutive uses of one node before the drain strategy rotates.
    pub drain_reuse_count: usize,

    // -- Requests --
    /// Default retry count for random-node requests.
    pub default_retry_count: u8,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Request plus path build timeout in seconds.
    pub path_build_timeout_secs: u64,
    /// Nodes reject signed requests whose timestamp drifts further than this.
    pub max_clock_drift_ms: u64,
    /// Maximum size of a wrapped message in bytes.
    pub max_message_bytes: usize,

    // -- Polling --
    /// Delay between successful swarm polls in milliseconds.
    pub poll_interval_ms: u64,
    /// Delay between successful community polls in milliseconds.
    pub community_poll_interval_ms: u64,
    /// Upper bound of the failure backoff in milliseconds.
    pub poll_backoff_max_ms: u64,
    /// Consecutive poll failures before the poller re-resolves its swarm.
    pub swarm_refresh_after_failures: u32,
    /// Dedup records without a server expiry are kept this long.
    pub default_message_ttl_ms: u64,
}

/// Era 0: the parameters of the current storage network.
pub const ERA_0: NetworkEra = NetworkEra {
    id: 0,

    // Swarms
    min_swarm_size: 3,
    drain_reuse_count: 3,

    // Requests
    default_retry_count: 3,
    request_timeout_secs: 10,
    path_build_timeout_secs: 30,
    max_clock_drift_ms: 30_000,
    max_message_bytes: 256 * 1024,

    // Polling
    poll_interval_ms: 1_500,
    community_poll_interval_ms: 4_000,
    poll_backoff_max_ms: 15_000,
    swarm_refresh_after_failures: 3,
    default_message_ttl_ms: 14 * 24 * 3600 * 1000, // 14 days
};

/// The current active era.
pub const CURRENT_ERA: &NetworkEra = &ERA_0;
