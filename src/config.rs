//! Embedder-facing configuration
//!
//! The control protocol that negotiates keys lives outside this crate; the
//! configuration here covers the knobs the data-channel core itself owns.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunnel endpoint configuration.
///
/// A zero duration leaves the corresponding keepalive timer disarmed, which
/// is also the default. Timers can be rescheduled at any time through
/// `Peer::set_keepalive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Send a keepalive packet after this long without outgoing traffic.
    #[serde(with = "humantime_serde")]
    pub keepalive_ping: Duration,

    /// Consider the peer dead after this long without incoming traffic.
    #[serde(with = "humantime_serde")]
    pub keepalive_timeout: Duration,

    /// Debug mode: outgoing data traffic does not reset the ping timer, so
    /// keepalives keep flowing at a fixed cadence even under load.
    pub keepalive_ignore_tx: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive_ping: Duration::ZERO,
            keepalive_timeout: Duration::ZERO,
            keepalive_ignore_tx: false,
        }
    }
}
