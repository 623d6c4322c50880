//! Request and connection options.

use crate::error::{Result, VaasError};
use std::time::Duration;

/// Per-request flags sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaasOptions {
    /// Allow the server to answer from its verdict cache
    pub use_cache: bool,

    /// Allow the server to answer from hash reputation lookups
    pub use_hash_lookup: bool,
}

impl Default for VaasOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            use_hash_lookup: true,
        }
    }
}

/// Keepalive period. Must stay below `read_timeout`.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(27);

/// Time allowed between two inbound frames (pongs included).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for one outbound write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing and recovery knobs for the persistent connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub keepalive_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,

    /// Re-establish the transport after it fails instead of closing the engine
    pub reconnect: bool,

    /// First reconnect delay, doubled per failed attempt
    pub backoff_initial: Duration,

    /// Upper bound for the reconnect delay
    pub backoff_max: Duration,

    /// How long `close` waits for in-flight requests
    pub drain_timeout: Duration,

    /// Capacity of the outbound request queue
    pub outbound_queue: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            reconnect: true,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            outbound_queue: 1024,
        }
    }
}

impl ConnectionOptions {
    /// Reject timings under which the peer's read timeout could fire before
    /// a keepalive or a hung write is noticed.
    pub fn validate(&self) -> Result<()> {
        if self.keepalive_interval >= self.read_timeout {
            return Err(VaasError::Config(format!(
                "keepalive interval {:?} must be shorter than read timeout {:?}",
                self.keepalive_interval, self.read_timeout
            )));
        }
        if self.write_timeout >= self.read_timeout {
            return Err(VaasError::Config(format!(
                "write timeout {:?} must be shorter than read timeout {:?}",
                self.write_timeout, self.read_timeout
            )));
        }
        if self.outbound_queue == 0 {
            return Err(VaasError::Config(
                "outbound queue capacity must be at least 1".to_string(),
            ));
        }
        if self.backoff_initial.is_zero() || self.backoff_initial > self.backoff_max {
            return Err(VaasError::Config(format!(
                "backoff must satisfy 0 < initial ({:?}) <= max ({:?})",
                self.backoff_initial, self.backoff_max
            )));
        }
        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.backoff_initial
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}
