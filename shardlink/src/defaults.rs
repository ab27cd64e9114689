//! Default values used by shardlink.

use std::time::Duration;

/// Control-channel endpoint used when no configuration overrides it.
pub const DEFAULT_HOLDER_ADDR: &str = "shitama.tldr.run:31337";

/// Fallback control-channel endpoint.
pub const DEFAULT_HOLDER_ADDR_ALT: &str = "115.159.87.170:31337";

/// The default bind address of the [`crate::EchoServer`].
pub const DEFAULT_ECHO_BIND_ADDR: &str = "0.0.0.0:31338";

/// How many copies of the probe payload are sent to every shard in one round.
///
/// Redundancy against loss and jitter; the copies are sent back to back.
pub const PROBES_PER_SHARD: usize = 16;

/// Contains all timeouts used by shardlink.
pub mod timeouts {
    use super::Duration;

    /// How long a probe round collects replies once all probes are sent.
    ///
    /// One deadline for the whole round, not per shard or per reply.
    pub const PROBE_WINDOW: Duration = Duration::from_secs(1);

    /// Timeout for resolving a shard or relay host address.
    pub const DNS_TIMEOUT: Duration = Duration::from_secs(1);
}
