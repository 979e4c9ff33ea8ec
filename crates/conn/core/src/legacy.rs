//! Deprecated gossip entry points, kept as thin adapters over the core.
//!
//! Every call logs a deprecation warning; `peers` is noisy enough that its
//! warning is rate-limited.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tangle_conn_hub::{HubEntry, HubEvent};
use tangle_peer::{Address, PeerRecord, Source};
use tokio::sync::broadcast;
use tracing::warn;

use crate::conn::Conn;
use crate::error::ConnError;

/// Minimum spacing between `peers` deprecation warnings.
const PEERS_WARNING_INTERVAL: Duration = Duration::from_secs(10);

/// The legacy gossip surface.
pub struct LegacyGossip {
    conn: Conn,
    last_peers_warning: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for LegacyGossip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LegacyGossip { .. }")
    }
}

impl LegacyGossip {
    pub(crate) fn new(conn: Conn) -> Self {
        Self {
            conn,
            last_peers_warning: Mutex::new(None),
        }
    }

    fn deprecated(&self, method: &str, replacement: &str) {
        warn!(method, replacement, "deprecated gossip method called");
    }

    /// Live hub entries.
    pub fn peers(&self) -> Vec<(Address, HubEntry)> {
        let mut last = self.last_peers_warning.lock();
        let due = last
            .map(|at| at.elapsed() >= PEERS_WARNING_INTERVAL)
            .unwrap_or(true);
        if due {
            *last = Some(Instant::now());
            self.deprecated("gossip.peers", "conn.peers");
        }
        self.conn.hub().entries()
    }

    /// Address book record for one address.
    pub fn get(&self, addr: &Address) -> Option<PeerRecord> {
        self.deprecated("gossip.get", "conn.db_peers");
        self.conn.db().get(addr)
    }

    pub async fn connect(&self, addr: Address) -> Result<(), ConnError> {
        self.deprecated("gossip.connect", "conn.connect");
        self.conn.connect(addr, None).await
    }

    pub async fn disconnect(&self, addr: &Address) -> Result<(), ConnError> {
        self.deprecated("gossip.disconnect", "conn.disconnect");
        self.conn.disconnect(addr).await
    }

    /// Hub lifecycle events.
    pub fn changes(&self) -> broadcast::Receiver<HubEvent> {
        self.deprecated("gossip.changes", "conn.listen");
        self.conn.listen()
    }

    /// Remember a peer. Source `local` is rejected at this boundary; local
    /// peers must come from discovery.
    pub fn add(&self, addr: Address, source: Source) -> Result<(), ConnError> {
        self.deprecated("gossip.add", "conn.remember");
        if source == Source::Local {
            return Err(ConnError::Legacy("gossip.add does not accept local peers"));
        }
        self.conn.remember(
            addr,
            PeerRecord {
                source: Some(source),
                ..Default::default()
            },
        )
    }

    pub fn remove(&self, addr: &Address) -> Result<(), ConnError> {
        self.deprecated("gossip.remove", "conn.forget");
        self.conn.forget(addr)
    }

    /// Drop every connection and let the scheduler re-fill.
    pub async fn reconnect(&self) {
        self.deprecated("gossip.reconnect", "conn.hub reset");
        self.conn.hub().reset().await;
    }

    /// Historical scheduling toggle; scheduling is always on now.
    pub fn enable(&self) {
        self.deprecated("gossip.enable", "conn.start");
    }

    /// Historical scheduling toggle; see [`enable`](Self::enable).
    pub fn disable(&self) {
        self.deprecated("gossip.disable", "conn.stop");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tangle_conn_hub::{Connection, DialError, Dialer};
    use tangle_conn_scheduler::{Capabilities, Discovery};
    use tangle_peer::FeedId;

    use super::*;
    use crate::config::ConnConfig;

    struct NoopConnection;

    #[async_trait]
    impl Connection for NoopConnection {
        async fn close(self: Box<Self>) {}
    }

    struct OkDialer;

    #[async_trait]
    impl Dialer for OkDialer {
        async fn dial(
            &self,
            _addr: &Address,
            _record: &PeerRecord,
        ) -> Result<Box<dyn Connection>, DialError> {
            Ok(Box::new(NoopConnection))
        }
    }

    fn conn() -> Conn {
        Conn::new(
            ConnConfig {
                autostart: false,
                ..Default::default()
            },
            Arc::new(OkDialer),
            Capabilities::default(),
            Discovery::default(),
        )
        .unwrap()
    }

    fn addr(b: u8) -> Address {
        Address::net(format!("host{b}.example.com"), 8008, FeedId::new([b; 32]))
    }

    #[tokio::test]
    async fn test_add_rejects_local_source() {
        let legacy = conn().legacy();
        assert!(matches!(
            legacy.add(addr(1), Source::Local),
            Err(ConnError::Legacy(_))
        ));
        legacy.add(addr(1), Source::Manual).unwrap();
    }

    #[tokio::test]
    async fn test_add_and_remove_roundtrip() {
        let c = conn();
        let legacy = c.legacy();
        legacy.add(addr(1), Source::Pub).unwrap();
        assert_eq!(
            c.db().get(&addr(1)).unwrap().source,
            Some(Source::Pub)
        );
        legacy.remove(&addr(1)).unwrap();
        assert!(!c.db().has(&addr(1)));
    }

    #[tokio::test]
    async fn test_enable_disable_are_noops() {
        let c = conn();
        let legacy = c.legacy();
        legacy.enable();
        legacy.disable();
        assert!(!c.scheduler().is_running());
    }

    #[tokio::test]
    async fn test_peers_delegates_to_hub() {
        let c = conn();
        let legacy = c.legacy();
        assert!(legacy.peers().is_empty());
        c.connect(addr(1), None).await.unwrap();
        assert_eq!(legacy.peers().len(), 1);
    }
}
