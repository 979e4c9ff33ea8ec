//! Connection registry and dial lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tangle_peer::{Address, Clock, PeerRecord};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::dialer::{Connection, DialError, Dialer};
use crate::events::{HubEvent, HubEventKind};
use crate::state::ConnectionState;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum HubError {
    /// Dial against an address with a live entry.
    #[error("already connected: {0}")]
    AlreadyConnected(Address),
    /// Operation on a closed hub, or a dial cancelled by teardown.
    #[error("hub is closed")]
    Shutdown,
    #[error(transparent)]
    Dial(#[from] DialError),
}

/// Snapshot of one hub entry.
#[derive(Debug, Clone)]
pub struct HubEntry {
    pub state: ConnectionState,
    pub record: PeerRecord,
}

/// Transport handles for an entry; kept out of the snapshot map so
/// snapshots stay cloneable.
struct DialHandle {
    task: Option<JoinHandle<()>>,
    conn: Option<Box<dyn Connection>>,
}

#[derive(Default)]
struct Entries {
    map: HashMap<Address, HubEntry>,
    handles: HashMap<Address, DialHandle>,
}

struct Shared {
    entries: Mutex<Entries>,
    events: broadcast::Sender<HubEvent>,
    live: watch::Sender<Vec<(Address, HubEntry)>>,
    closed: AtomicBool,
}

/// Live registry of connections keyed by address.
///
/// All state transitions happen under one lock and emit on one broadcast
/// stream, so every listener observes every transition in the same order.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
    dialer: Arc<dyn Dialer>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("entries", &self.shared.entries.lock().map.len())
            .finish()
    }
}

impl Hub {
    pub fn new(dialer: Arc<dyn Dialer>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (live, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(Entries::default()),
                events,
                live,
                closed: AtomicBool::new(false),
            }),
            dialer,
            clock,
        }
    }

    /// Initiate a dial and wait for it to complete.
    ///
    /// The entry is marked `connecting` synchronously; the transport dial
    /// runs on its own task so teardown can cancel it. A cancelled dial
    /// resolves to [`HubError::Shutdown`].
    pub async fn connect(&self, addr: Address, data: Option<PeerRecord>) -> Result<(), HubError> {
        let rx = self.begin_connect(addr, data)?;
        rx.await.map_err(|_| HubError::Shutdown)?
    }

    /// Synchronous half of [`connect`](Self::connect): validates, marks the
    /// entry `connecting`, and spawns the dial task. The receiver resolves
    /// with the dial outcome.
    pub fn begin_connect(
        &self,
        addr: Address,
        data: Option<PeerRecord>,
    ) -> Result<oneshot::Receiver<Result<(), HubError>>, HubError> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(HubError::Shutdown);
        }

        let (tx, rx) = oneshot::channel();
        let mut entries = self.shared.entries.lock();

        if let Some(entry) = entries.map.get(&addr) {
            if entry.state.is_in_connection() {
                return Err(HubError::AlreadyConnected(addr));
            }
        }

        let mut record = match (data, entries.map.get(&addr)) {
            (Some(data), Some(existing)) => {
                let mut record = existing.record.clone();
                record.merge(&data);
                record
            }
            (Some(data), None) => data,
            (None, Some(existing)) => existing.record.clone(),
            (None, None) => PeerRecord::default(),
        };
        if record.key.is_none() {
            record.key = addr.key().copied();
        }
        if record.host.is_none() {
            record.host = addr.host().map(str::to_string);
        }
        if record.port.is_none() {
            record.port = addr.port();
        }
        record.state_change = Some(self.clock.now_ms());

        entries.map.insert(
            addr.clone(),
            HubEntry {
                state: ConnectionState::Connecting,
                record: record.clone(),
            },
        );
        self.emit(&entries, HubEventKind::Connecting, &addr, None);
        trace!(address = %addr, "dialing");

        let hub = self.clone();
        let dial_addr = addr.clone();
        let task = tokio::spawn(async move {
            let result = hub.dialer.dial(&dial_addr, &record).await;
            hub.finish_dial(&dial_addr, result, tx);
        });
        entries.handles.insert(
            addr,
            DialHandle {
                task: Some(task),
                conn: None,
            },
        );
        self.publish_live(&entries);

        Ok(rx)
    }

    /// Apply the dial outcome. The entry may have been disconnected or the
    /// hub closed while the dial was in flight; in that case the fresh
    /// connection is torn down again.
    fn finish_dial(
        &self,
        addr: &Address,
        result: Result<Box<dyn Connection>, DialError>,
        tx: oneshot::Sender<Result<(), HubError>>,
    ) {
        let mut entries = self.shared.entries.lock();

        let still_connecting = entries
            .map
            .get(addr)
            .map(|e| e.state == ConnectionState::Connecting)
            .unwrap_or(false);
        if !still_connecting {
            if let Ok(conn) = result {
                tokio::spawn(conn.close());
            }
            let _ = tx.send(Err(HubError::Shutdown));
            return;
        }

        match result {
            Ok(conn) => {
                let now = self.clock.now_ms();
                if let Some(entry) = entries.map.get_mut(addr) {
                    entry.state = ConnectionState::Connected;
                    entry.record.state_change = Some(now);
                }
                if let Some(handle) = entries.handles.get_mut(addr) {
                    handle.task = None;
                    handle.conn = Some(conn);
                }
                self.emit(&entries, HubEventKind::Connected, addr, None);
                debug!(address = %addr, "connected");
                let _ = tx.send(Ok(()));
            }
            Err(e) => {
                entries.map.remove(addr);
                entries.handles.remove(addr);
                self.emit(&entries, HubEventKind::ConnectingFailed, addr, Some(e.to_string()));
                debug!(address = %addr, error = %e, "dial failed");
                let _ = tx.send(Err(e.into()));
            }
        }
        self.publish_live(&entries);
    }

    /// Tear down the transport and drop the entry. Idempotent on addresses
    /// without an entry.
    pub async fn disconnect(&self, addr: &Address) -> Result<(), HubError> {
        let handle = {
            let mut entries = self.shared.entries.lock();
            if entries.map.remove(addr).is_none() {
                return Ok(());
            }
            let handle = entries.handles.remove(addr);
            self.emit(&entries, HubEventKind::Disconnected, addr, None);
            self.publish_live(&entries);
            handle
        };
        Self::teardown(handle).await;
        debug!(address = %addr, "disconnected");
        Ok(())
    }

    pub fn get_state(&self, addr: &Address) -> Option<ConnectionState> {
        self.shared.entries.lock().map.get(addr).map(|e| e.state)
    }

    pub fn get_record(&self, addr: &Address) -> Option<PeerRecord> {
        self.shared
            .entries
            .lock()
            .map
            .get(addr)
            .map(|e| e.record.clone())
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<(Address, HubEntry)> {
        self.shared
            .entries
            .lock()
            .map
            .iter()
            .map(|(a, e)| (a.clone(), e.clone()))
            .collect()
    }

    /// Watch stream emitting the full entry set on every change.
    pub fn live_entries(&self) -> watch::Receiver<Vec<(Address, HubEntry)>> {
        self.shared.live.subscribe()
    }

    /// Infinite event stream of connection lifecycle transitions.
    pub fn listen(&self) -> broadcast::Receiver<HubEvent> {
        self.shared.events.subscribe()
    }

    /// Forcibly disconnect all entries (wakeup / network change).
    pub async fn reset(&self) {
        let addrs: Vec<Address> = {
            let entries = self.shared.entries.lock();
            entries.map.keys().cloned().collect()
        };
        for addr in addrs {
            let _ = self.disconnect(&addr).await;
        }
    }

    /// Permanent shutdown: cancels in-flight dials and closes every
    /// connection. Further operations are rejected with
    /// [`HubError::Shutdown`].
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        let handles = {
            let mut entries = self.shared.entries.lock();
            let addrs: Vec<Address> = entries.map.keys().cloned().collect();
            let mut handles = Vec::new();
            for addr in addrs {
                entries.map.remove(&addr);
                handles.push(entries.handles.remove(&addr));
                self.emit(&entries, HubEventKind::Disconnected, &addr, None);
            }
            self.publish_live(&entries);
            handles
        };
        for handle in handles {
            Self::teardown(handle).await;
        }
    }

    async fn teardown(handle: Option<DialHandle>) {
        if let Some(handle) = handle {
            if let Some(task) = handle.task {
                task.abort();
            }
            if let Some(conn) = handle.conn {
                conn.close().await;
            }
        }
    }

    fn emit(&self, entries: &Entries, kind: HubEventKind, addr: &Address, details: Option<String>) {
        let key = entries
            .map
            .get(addr)
            .and_then(|e| e.record.key)
            .or_else(|| addr.key().copied());
        let _ = self.shared.events.send(HubEvent {
            kind,
            address: addr.clone(),
            key,
            details,
        });
    }

    fn publish_live(&self, entries: &Entries) {
        let snapshot: Vec<(Address, HubEntry)> = entries
            .map
            .iter()
            .map(|(a, e)| (a.clone(), e.clone()))
            .collect();
        let _ = self.shared.live.send(snapshot);
    }
}
