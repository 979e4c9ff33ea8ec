//! Per-peer metadata shared by the address book, hub, and staging pools.

use serde::{Deserialize, Serialize};

use crate::feed::FeedId;

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Seed,
    Pub,
    Manual,
    Local,
    Friend,
    Dht,
    Bt,
}

/// Policy class of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerClass {
    Internet,
    Lan,
    Bt,
    Pub,
    Room,
    Dht,
}

/// Rolling statistics over an observed quantity (ping RTT, connection
/// duration). Mean is maintained incrementally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingStats {
    pub count: u32,
    pub sum: f64,
    pub mean: f64,
}

impl RollingStats {
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.mean = self.sum / self.count as f64;
    }

    pub fn has_samples(&self) -> bool {
        self.count > 0
    }
}

/// Metadata stored for a peer in staging or the address book.
///
/// All fields are optional so partial updates can be merged over existing
/// records; a record is only considered valid once it carries a key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerRecord {
    pub key: Option<FeedId>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub source: Option<Source>,
    #[serde(rename = "type")]
    pub class: Option<PeerClass>,
    pub autoconnect: Option<bool>,
    /// Wall-clock ms of the last connection state transition.
    pub state_change: Option<u64>,
    /// Wall-clock ms of the last staging refresh (staging pool only).
    pub staging_updated: Option<u64>,
    /// Consecutive dial failures since the last success.
    pub failure: Option<u32>,
    /// Round-trip statistics from the heartbeat.
    pub ping: Option<RollingStats>,
    /// Connection duration statistics.
    pub duration: Option<RollingStats>,
    pub verified: Option<bool>,
    pub note: Option<String>,
}

impl PeerRecord {
    pub fn with_key(key: FeedId) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }

    /// Autoconnect defaults to true when unset.
    pub fn autoconnect(&self) -> bool {
        self.autoconnect.unwrap_or(true)
    }

    pub fn failures(&self) -> u32 {
        self.failure.unwrap_or(0)
    }

    /// No dial has ever been attempted.
    pub fn has_no_attempts(&self) -> bool {
        self.state_change.is_none()
    }

    /// At least one connection ran to completion.
    pub fn has_successful_attempts(&self) -> bool {
        self.duration.map(|d| d.has_samples()).unwrap_or(false)
    }

    /// At least one attempt was made and none succeeded.
    pub fn has_only_failed_attempts(&self) -> bool {
        self.failures() > 0 && !self.has_successful_attempts()
    }

    /// The heartbeat has measured a round-trip.
    pub fn has_pinged(&self) -> bool {
        self.ping.map(|p| p.has_samples()).unwrap_or(false)
    }

    /// Successfully connected in the past but never answered a ping.
    pub fn is_legacy(&self) -> bool {
        self.has_successful_attempts() && !self.has_pinged()
    }

    /// Overlay `other`'s set fields onto this record.
    pub fn merge(&mut self, other: &PeerRecord) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field.clone();
                }
            };
        }
        take!(key);
        take!(host);
        take!(port);
        take!(source);
        take!(class);
        take!(autoconnect);
        take!(state_change);
        take!(staging_updated);
        take!(failure);
        take!(ping);
        take!(duration);
        take!(verified);
        take!(note);
    }

    /// Debounce group for this record: the host when present, the key
    /// otherwise.
    pub fn group(&self) -> Option<String> {
        self.host
            .clone()
            .or_else(|| self.key.map(|k| k.to_base64()))
    }
}
