//! The scheduler drives the system toward a target connection profile:
//! a periodic, fuzzed control loop that partitions peers into classes,
//! enforces per-class quotas with exponential backoff and group
//! debouncing, and reacts to network, wakeup, discovery, and disconnect
//! events, all while respecting the social follow/block graph.

mod capabilities;
mod classes;
mod discovery;
mod net;
mod scheduler;

pub use capabilities::{
    AlwaysOnline, BtPeer, Capabilities, Discovery, LanPeer, MessageLog, NetworkMonitor,
    NoMessageLog, NoSocialGraph, PubAnnouncement, SocialGraph,
};
pub use classes::ClassPolicy;
pub use net::{can_be_connected, is_local, CachedNetwork};
pub use scheduler::{Scheduler, SchedulerConfig};
