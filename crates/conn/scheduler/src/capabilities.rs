//! Optional collaborators the scheduler dispatches on.
//!
//! Each ambient capability is an interface with a null-object default, so
//! an absent collaborator costs a no-op instead of a runtime feature probe.

use tangle_peer::FeedId;
use tokio::sync::mpsc;

/// Social-graph distance provider. Hops of −1 denote a blocked key, 1 a
/// direct follow, 0 self, > 1 friend-of-friend.
pub trait SocialGraph: Send + Sync {
    /// False while the hops table is still loading; ticks are suppressed
    /// until it turns true.
    fn ready(&self) -> bool {
        true
    }

    fn hops(&self, key: &FeedId) -> Option<f64>;
}

/// Null object: nobody is followed, nobody is blocked, never loading.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSocialGraph;

impl SocialGraph for NoSocialGraph {
    fn hops(&self, _key: &FeedId) -> Option<f64> {
        None
    }
}

/// Reports whether the machine currently has a usable network.
pub trait NetworkMonitor: Send + Sync {
    fn has_network(&self) -> bool;
}

/// Null object for setups without connectivity detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl NetworkMonitor for AlwaysOnline {
    fn has_network(&self) -> bool {
        true
    }
}

/// The message log, observed for readiness and download activity.
pub trait MessageLog: Send + Sync {
    /// False until the log has finished its initial indexing.
    fn ready(&self) -> bool {
        true
    }

    /// Wall-clock ms of the most recently appended message; a message in
    /// the last 500 ms means a download is likely in progress.
    fn last_message_ms(&self) -> Option<u64>;
}

/// Null object for setups without a message log.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMessageLog;

impl MessageLog for NoMessageLog {
    fn last_message_ms(&self) -> Option<u64> {
        None
    }
}

/// A pub announcement observed in the message log.
#[derive(Debug, Clone)]
pub struct PubAnnouncement {
    /// Multiserver address string as announced; validated on intake.
    pub address: String,
}

/// A peer seen on the local network.
#[derive(Debug, Clone)]
pub struct LanPeer {
    pub address: String,
    pub verified: bool,
}

/// A nearby Bluetooth device.
#[derive(Debug, Clone)]
pub struct BtPeer {
    /// MAC with colons stripped, as it appears in `bt:` addresses.
    pub device: String,
    pub key: FeedId,
}

/// The ambient collaborators, all defaulting to null objects.
pub struct Capabilities {
    pub social_graph: std::sync::Arc<dyn SocialGraph>,
    pub network: std::sync::Arc<dyn NetworkMonitor>,
    pub message_log: std::sync::Arc<dyn MessageLog>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Capabilities { .. }")
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            social_graph: std::sync::Arc::new(NoSocialGraph),
            network: std::sync::Arc::new(AlwaysOnline),
            message_log: std::sync::Arc::new(NoMessageLog),
        }
    }
}

/// Discovery intake streams, presence-detected at startup. A `None`
/// stream simply skips that intake task.
#[derive(Debug, Default)]
pub struct Discovery {
    pub pubs: Option<mpsc::Receiver<PubAnnouncement>>,
    pub lan: Option<mpsc::Receiver<LanPeer>>,
    pub bt: Option<mpsc::Receiver<BtPeer>>,
}
