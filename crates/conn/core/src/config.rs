//! Facade configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tangle_peer::{Address, Clock, SystemClock};

/// Configuration for [`Conn`](crate::Conn).
#[derive(Clone)]
pub struct ConnConfig {
    /// Address book storage directory; in-memory when unset.
    pub path: Option<PathBuf>,
    /// Start the scheduler as part of [`Conn::start`](crate::Conn::start).
    pub autostart: bool,
    /// Run the seed class.
    pub seed: bool,
    /// Consume pub announcements from the message log.
    pub pub_discovery: bool,
    /// Remember discovered pubs in the address book.
    pub auto_populate: bool,
    /// Seed addresses pre-populated into the address book.
    pub seeds: Vec<Address>,
    /// Heartbeat timeout; clamped to [10 s, 30 min] when used.
    pub ping_timeout: Duration,
    /// Seed for the scheduling RNG; None draws from entropy.
    pub rng_seed: Option<u64>,
    /// Wall-clock source, overridable for tests.
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ConnConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnConfig")
            .field("path", &self.path)
            .field("autostart", &self.autostart)
            .field("seed", &self.seed)
            .field("pub_discovery", &self.pub_discovery)
            .field("auto_populate", &self.auto_populate)
            .field("seeds", &self.seeds)
            .field("ping_timeout", &self.ping_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            path: None,
            autostart: true,
            seed: true,
            pub_discovery: true,
            auto_populate: true,
            seeds: Vec::new(),
            ping_timeout: crate::ping::DEFAULT_PING_TIMEOUT,
            rng_seed: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl ConnConfig {
    /// Parse seed addresses given as one string or many, skipping (and
    /// reporting) malformed entries.
    pub fn with_seed_strs<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for seed in seeds {
            match seed.as_ref().parse() {
                Ok(addr) => self.seeds.push(addr),
                Err(e) => tracing::warn!(error = %e, "ignoring malformed seed address"),
            }
        }
        self
    }
}
