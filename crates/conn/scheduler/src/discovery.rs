//! Discovery intake: pub announcements, LAN beacons, nearby Bluetooth
//! devices. Followed peers are dialed immediately; everything else lands
//! in staging and takes its chances with the next tick.

use std::time::Duration;

use tangle_peer::{Address, PeerClass, PeerRecord, Source};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::capabilities::{BtPeer, LanPeer, PubAnnouncement};
use crate::scheduler::Scheduler;

/// Per-announcement pacing so a burst of pub messages does not flood the
/// staging pool.
const PUB_THROTTLE: Duration = Duration::from_millis(250);
/// Intake pauses while this many pubs are staged.
const PUB_VALVE_LIMIT: usize = 3;

impl Scheduler {
    /// Consume pub announcements from the message log. Honors
    /// back-pressure: while [`PUB_VALVE_LIMIT`] pubs are staged the loop
    /// parks on the staging change stream and the bounded channel fills.
    pub(crate) async fn run_pub_intake(self, mut rx: mpsc::Receiver<PubAnnouncement>) {
        let mut staged = self.inner.staging.live_entries();
        while let Some(announcement) = rx.recv().await {
            tokio::time::sleep(PUB_THROTTLE).await;

            while self.staged_pub_count() >= PUB_VALVE_LIMIT {
                if staged.changed().await.is_err() {
                    return;
                }
            }

            let addr: Address = match announcement.address.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    debug!(error = %e, "ignoring invalid pub address");
                    continue;
                }
            };
            let Some(key) = addr.key().copied() else {
                debug!(address = %addr, "ignoring keyless pub address");
                continue;
            };
            if self.inner.db.has(&addr) {
                trace!(address = %addr, "pub already known");
                continue;
            }

            let record = PeerRecord {
                key: Some(key),
                host: addr.host().map(str::to_string),
                port: addr.port(),
                source: Some(Source::Pub),
                class: Some(PeerClass::Pub),
                ..Default::default()
            };
            self.inner.staging.stage(addr.clone(), record.clone());

            let remembered = PeerRecord {
                autoconnect: Some(false),
                ..record
            };
            if self.inner.db.set(addr.clone(), remembered).is_ok() {
                debug!(address = %addr, "discovered pub");
            }
        }
    }

    fn staged_pub_count(&self) -> usize {
        self.inner
            .staging
            .entries()
            .iter()
            .filter(|(_, r)| r.class == Some(PeerClass::Pub))
            .count()
    }

    /// Consume LAN discovery beacons.
    pub(crate) async fn run_lan_intake(self, mut rx: mpsc::Receiver<LanPeer>) {
        while let Some(peer) = rx.recv().await {
            let addr: Address = match peer.address.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    debug!(error = %e, "ignoring invalid lan address");
                    continue;
                }
            };
            let record = PeerRecord {
                key: addr.key().copied(),
                host: addr.host().map(str::to_string),
                port: addr.port(),
                source: Some(Source::Local),
                class: Some(PeerClass::Lan),
                verified: Some(peer.verified),
                ..Default::default()
            };
            if self.followed(&record) {
                debug!(address = %addr, "dialing followed lan peer");
                if let Err(e) = self.inner.hub.begin_connect(addr, Some(record)) {
                    trace!(error = %e, "lan dial not started");
                }
            } else {
                self.inner.staging.stage(addr, record);
            }
        }
    }

    /// Consume nearby Bluetooth devices, synthesizing their addresses.
    pub(crate) async fn run_bt_intake(self, mut rx: mpsc::Receiver<BtPeer>) {
        while let Some(peer) = rx.recv().await {
            let addr = Address::bt(peer.device, peer.key);
            let record = PeerRecord {
                key: Some(peer.key),
                host: addr.host().map(str::to_string),
                source: Some(Source::Bt),
                class: Some(PeerClass::Bt),
                ..Default::default()
            };
            if self.followed(&record) {
                debug!(address = %addr, "dialing followed bluetooth peer");
                if let Err(e) = self.inner.hub.begin_connect(addr, Some(record)) {
                    trace!(error = %e, "bluetooth dial not started");
                }
            } else {
                self.inner.staging.stage(addr, record);
            }
        }
    }
}
