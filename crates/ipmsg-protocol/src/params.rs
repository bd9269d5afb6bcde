//! Protocol parameters -- the timing and sizing values peers assume of each other.
//!
//! Heartbeat and typing timings only work when both ends use compatible values:
//! a peer that heartbeats every 60s is evicted by one that times out after 30s.
//! Node-local knobs (retry budget, connect timeout) live here too so that
//! configuration defaults have a single source.

/// A named set of protocol timing and sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    // -- Presence --
    /// Seconds between heartbeat broadcasts.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat interval on constrained / low-power devices.
    pub low_power_heartbeat_interval_secs: u64,
    /// Seconds between timeout checks.
    pub timeout_check_interval_secs: u64,
    /// Consecutive failed checks before a peer is evicted.
    pub heartbeat_miss_limit: u32,

    // -- Recall --
    /// Seconds after sending during which a message may be recalled.
    pub recall_window_secs: u64,
    /// Hours a recall record is retained before cleanup.
    pub recall_retention_hours: u64,

    // -- Typing --
    /// Milliseconds before a remote typing indicator expires.
    pub typing_timeout_ms: u64,
    /// Minimum milliseconds between TYPING broadcasts to the same peer.
    pub typing_debounce_ms: u64,
    /// Milliseconds between typing-state cleanup passes.
    pub typing_cleanup_interval_ms: u64,

    // -- Delivery --
    /// Send attempts before giving up on a host.
    pub max_retries: u32,
    /// Base retry delay in milliseconds: base * 2^attempt.
    pub retry_base_delay_ms: u64,
    /// Bound on a TCP connect in seconds.
    pub connect_timeout_secs: u64,
    /// Bytes requested per TCP receive.
    pub receive_buffer: usize,

    // -- File transfer --
    /// File block size in bytes.
    pub block_size: usize,
}

impl ProtocolParams {
    /// Heartbeat interval for the given power mode.
    pub const fn heartbeat_interval(&self, low_power: bool) -> u64 {
        if low_power {
            self.low_power_heartbeat_interval_secs
        } else {
            self.heartbeat_interval_secs
        }
    }

    /// A peer is considered offline after two missed heartbeat intervals.
    pub const fn heartbeat_timeout(&self, low_power: bool) -> u64 {
        self.heartbeat_interval(low_power) * 2
    }
}

/// Default parameters.
pub const DEFAULT_PARAMS: ProtocolParams = ProtocolParams {
    // Presence
    heartbeat_interval_secs: 30,
    low_power_heartbeat_interval_secs: 60,
    timeout_check_interval_secs: 10,
    heartbeat_miss_limit: 3,

    // Recall
    recall_window_secs: 120,
    recall_retention_hours: 24,

    // Typing
    typing_timeout_ms: 5_000,
    typing_debounce_ms: 1_000,
    typing_cleanup_interval_ms: 1_000,

    // Delivery
    max_retries: 3,
    retry_base_delay_ms: 1_000,
    connect_timeout_secs: 5,
    receive_buffer: 4096,

    // File transfer
    block_size: 64 * 1024,
};

/// Parameters in effect for this build.
pub const CURRENT_PARAMS: &ProtocolParams = &DEFAULT_PARAMS;
