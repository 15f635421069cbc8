use std::time::Duration;

use crate::host::PeerInfo;

/// Runtime configuration for the relay finder.
#[derive(Clone, Debug)]
pub struct Config {
    /// Target number of live relay reservations.
    pub desired_relays: usize,
    /// Candidates to accumulate before the first reservation pass (startup quorum).
    pub min_candidates: usize,
    /// Cap on the candidate table and on the backoff queue.
    pub max_candidates: usize,
    /// Reservation attempts per candidate before it is dropped for good.
    pub max_attempts: usize,
    /// How long to wait for the startup quorum before attempting anyway.
    pub boot_delay: Duration,
    /// Base delay for the exponential backoff after a failed reservation.
    pub backoff: Duration,
    /// Optional seed relays, probed ahead of the discovery stream. When set,
    /// the startup quorum only defers while probes are still outstanding.
    pub static_relays: Vec<PeerInfo>,
    /// Seed for candidate selection and backoff jitter. `None` uses entropy.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            desired_relays: 2,
            min_candidates: 4,
            max_candidates: 20,
            max_attempts: 3,
            boot_delay: Duration::from_secs(3 * 60),
            backoff: Duration::from_secs(60 * 60),
            static_relays: Vec::new(),
            rng_seed: None,
        }
    }
}

/// Builder for relay finder configuration to centralize defaults and overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self { config: Config::default() }
    }

    pub fn desired_relays(mut self, desired_relays: usize) -> Self {
        self.config.desired_relays = desired_relays;
        self
    }

    pub fn min_candidates(mut self, min_candidates: usize) -> Self {
        self.config.min_candidates = min_candidates;
        self
    }

    pub fn max_candidates(mut self, max_candidates: usize) -> Self {
        self.config.max_candidates = max_candidates;
        self
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    pub fn boot_delay(mut self, boot_delay: Duration) -> Self {
        self.config.boot_delay = boot_delay;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn static_relays(mut self, static_relays: Vec<PeerInfo>) -> Self {
        self.config.static_relays = static_relays;
        self
    }

    pub fn rng_seed(mut self, rng_seed: Option<u64>) -> Self {
        self.config.rng_seed = rng_seed;
        self
    }

    pub fn build(self) -> Config {
        let mut config = self.config;
        config.desired_relays = config.desired_relays.max(1);
        config.max_candidates = config.max_candidates.max(1);
        config
    }
}
