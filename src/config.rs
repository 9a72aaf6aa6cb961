//! Timing knobs for one peer.

use std::time::Duration;

use rand::Rng;

/// Configurable timer parameters of a peer.
///
/// Every peer in a group must run the same configuration. Any values may be chosen under the
/// constraint that `heartbeat_interval` is much smaller than `election_timeout_min`, and
/// `election_timeout_max` is large enough that randomized timeouts reliably separate
/// competing candidacies.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// The minimum randomized election timeout.
    pub election_timeout_min: Duration,

    /// The maximum randomized election timeout.
    pub election_timeout_max: Duration,

    /// The fixed pacing of leader heartbeats.
    pub heartbeat_interval: Duration,
}

impl Config {
    /// Draws a fresh election timeout uniformly from
    /// `[election_timeout_min, election_timeout_max]`.
    pub fn random_election_timeout(&self) -> Duration {
        rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(800),
            election_timeout_max: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}
