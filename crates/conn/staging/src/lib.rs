//! Ephemeral set of candidate addresses discovered out of band, waiting to
//! be promoted into the hub or to age out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use auto_impl::auto_impl;
use parking_lot::Mutex;
use tangle_peer::{Address, Clock, PeerRecord};
use tokio::sync::{broadcast, watch};
use tracing::trace;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Answers whether an address is currently live in the hub. Staging must
/// refuse candidates that are already in flight.
#[auto_impl(&, Box, Arc)]
pub trait LivenessProbe: Send + Sync {
    fn is_live(&self, addr: &Address) -> bool;
}

/// Probe for setups without a hub (tests, tooling).
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverLive;

impl LivenessProbe for NeverLive {
    fn is_live(&self, _addr: &Address) -> bool {
        false
    }
}

/// Staging pool change events, consumed by the interpool glue.
#[derive(Debug, Clone)]
pub enum StagingEvent {
    Staged { address: Address },
    Unstaged { address: Address },
}

struct Shared {
    entries: Mutex<HashMap<Address, PeerRecord>>,
    events: broadcast::Sender<StagingEvent>,
    live: watch::Sender<Vec<(Address, PeerRecord)>>,
    closed: AtomicBool,
}

/// Ephemeral candidate set with per-entry metadata and a live change stream.
#[derive(Clone)]
pub struct Staging {
    shared: Arc<Shared>,
    probe: Arc<dyn LivenessProbe>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Staging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Staging")
            .field("entries", &self.shared.entries.lock().len())
            .finish()
    }
}

impl Staging {
    pub fn new(probe: Arc<dyn LivenessProbe>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (live, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                events,
                live,
                closed: AtomicBool::new(false),
            }),
            probe,
            clock,
        }
    }

    /// Insert a candidate. Refused (returns false) when the address is
    /// already staged, already live in the hub, or the pool is closed.
    /// Stamps `staging_updated` on the stored record.
    pub fn stage(&self, addr: Address, mut data: PeerRecord) -> bool {
        if self.shared.closed.load(Ordering::Relaxed) {
            return false;
        }
        if self.probe.is_live(&addr) {
            trace!(address = %addr, "refusing to stage live address");
            return false;
        }
        let mut entries = self.shared.entries.lock();
        if entries.contains_key(&addr) {
            return false;
        }
        if data.key.is_none() {
            data.key = addr.key().copied();
        }
        data.staging_updated = Some(self.clock.now_ms());
        entries.insert(addr.clone(), data);
        let _ = self.shared.events.send(StagingEvent::Staged {
            address: addr.clone(),
        });
        self.publish_live(&entries);
        trace!(address = %addr, "staged");
        true
    }

    /// Remove a candidate. Returns whether it was present.
    pub fn unstage(&self, addr: &Address) -> bool {
        let mut entries = self.shared.entries.lock();
        if entries.remove(addr).is_none() {
            return false;
        }
        let _ = self.shared.events.send(StagingEvent::Unstaged {
            address: addr.clone(),
        });
        self.publish_live(&entries);
        trace!(address = %addr, "unstaged");
        true
    }

    pub fn get(&self, addr: &Address) -> Option<PeerRecord> {
        self.shared.entries.lock().get(addr).cloned()
    }

    pub fn entries(&self) -> Vec<(Address, PeerRecord)> {
        self.shared
            .entries
            .lock()
            .iter()
            .map(|(a, r)| (a.clone(), r.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.lock().is_empty()
    }

    /// Watch stream emitting the full candidate set on every change.
    pub fn live_entries(&self) -> watch::Receiver<Vec<(Address, PeerRecord)>> {
        self.shared.live.subscribe()
    }

    pub fn listen(&self) -> broadcast::Receiver<StagingEvent> {
        self.shared.events.subscribe()
    }

    /// Drop all candidates and refuse further staging.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        let mut entries = self.shared.entries.lock();
        entries.clear();
        self.publish_live(&entries);
    }

    fn publish_live(&self, entries: &HashMap<Address, PeerRecord>) {
        let snapshot: Vec<(Address, PeerRecord)> = entries
            .iter()
            .map(|(a, r)| (a.clone(), r.clone()))
            .collect();
        let _ = self.shared.live.send(snapshot);
    }
}
