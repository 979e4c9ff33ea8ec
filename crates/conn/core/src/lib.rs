//! Connection-management core of the tangle gossip overlay.
//!
//! Wires the four parts together: the durable [`AddressBook`], the live
//! [`Hub`], the ephemeral [`Staging`] pool, and the [`Scheduler`] that
//! drives transitions between them under policy. The [`Conn`] facade is
//! the surface an RPC layer exposes to clients.

mod config;
mod conn;
mod error;
mod glue;
mod legacy;
mod ping;

pub use config::ConnConfig;
pub use conn::Conn;
pub use error::ConnError;
pub use legacy::LegacyGossip;
pub use ping::Ping;

pub use tangle_conn_db::{AddressBook, FileStore, MemoryStore, RecordStore, StoreError};
pub use tangle_conn_hub::{
    Connection, ConnectionState, DialError, Dialer, Hub, HubEntry, HubError, HubEvent,
    HubEventKind,
};
pub use tangle_conn_query::{Origin, PeerQuery, Query};
pub use tangle_conn_scheduler::{
    BtPeer, Capabilities, Discovery, LanPeer, MessageLog, NetworkMonitor, PubAnnouncement,
    Scheduler, SocialGraph,
};
pub use tangle_conn_staging::{LivenessProbe, Staging, StagingEvent};
pub use tangle_peer::{
    Address, AddressError, Clock, FeedId, ManualClock, PeerClass, PeerRecord, RollingStats,
    Source, SystemClock, Transport,
};
