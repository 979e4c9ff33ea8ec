//! Peer identity and addressing primitives for the tangle gossip overlay.
//!
//! - [`FeedId`] - ed25519 public identity, rendered `@<base64>.ed25519`
//! - [`Address`] - multiserver address (`transport:host:port~shs:key`)
//! - [`PeerRecord`] - per-peer metadata shared by the connection pools

mod address;
mod clock;
mod error;
mod feed;
mod record;

pub use address::{Address, Auth, Location, Transport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::AddressError;
pub use feed::FeedId;
pub use record::{PeerClass, PeerRecord, RollingStats, Source};
