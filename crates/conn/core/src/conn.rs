//! The facade composing the pools, the scheduler, and the glue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tangle_conn_db::{AddressBook, FileStore, MemoryStore};
use tangle_conn_hub::{Dialer, Hub, HubEntry, HubEvent};
use tangle_conn_query::Query;
use tangle_conn_scheduler::{Capabilities, Discovery, Scheduler, SchedulerConfig};
use tangle_conn_staging::{LivenessProbe, Staging};
use tangle_peer::{Address, AddressError, FeedId, PeerRecord, Source};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ConnConfig;
use crate::error::ConnError;
use crate::glue;
use crate::legacy::LegacyGossip;
use crate::ping::Ping;

/// File name of the address book image inside the configured directory.
const DB_FILE: &str = "conn.json";

struct HubProbe(Hub);

impl LivenessProbe for HubProbe {
    fn is_live(&self, addr: &Address) -> bool {
        self.0
            .get_state(addr)
            .map(|s| s.is_in_connection())
            .unwrap_or(false)
    }
}

struct Inner {
    db: AddressBook,
    hub: Hub,
    staging: Staging,
    query: Query,
    scheduler: Scheduler,
    config: ConnConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    launched: AtomicBool,
}

/// The connection-management core: address book, hub, staging, and the
/// scheduler, behind one surface for the RPC layer.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("db", &self.inner.db)
            .field("hub", &self.inner.hub)
            .field("staging", &self.inner.staging)
            .finish()
    }
}

impl Conn {
    /// Build the core. Nothing is spawned yet; call
    /// [`launch`](Self::launch) once a runtime is available.
    pub fn new(
        config: ConnConfig,
        dialer: Arc<dyn Dialer>,
        capabilities: Capabilities,
        discovery: Discovery,
    ) -> Result<Self, ConnError> {
        let clock = config.clock.clone();
        let db = match &config.path {
            Some(dir) => AddressBook::open(FileStore::new(dir.join(DB_FILE))?)?,
            None => AddressBook::open(MemoryStore::new())?,
        };
        let hub = Hub::new(dialer, clock.clone());
        let staging = Staging::new(Arc::new(HubProbe(hub.clone())), clock.clone());
        let query = Query::new(db.clone(), hub.clone(), staging.clone());

        let scheduler = Scheduler::new(
            db.clone(),
            hub.clone(),
            staging.clone(),
            capabilities,
            discovery,
            SchedulerConfig {
                seed_class: config.seed,
                pub_discovery: config.pub_discovery,
                auto_populate: config.auto_populate,
                seeds: config.seeds.clone(),
                rng_seed: config.rng_seed,
            },
            clock,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                hub,
                staging,
                query,
                scheduler,
                config,
                tasks: Mutex::new(Vec::new()),
                launched: AtomicBool::new(false),
            }),
        })
    }

    /// Spawn the interpool glue and the address book flusher, and start
    /// the scheduler when `autostart` is configured. Idempotent.
    pub fn launch(&self) {
        if self.inner.launched.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(glue::run_glue(
            self.inner.hub.clone(),
            self.inner.staging.clone(),
        )));
        tasks.push(tokio::spawn(self.inner.db.clone().run_flusher()));
        drop(tasks);

        if self.inner.config.autostart {
            self.inner.scheduler.start();
        }
        debug!("connection core launched");
    }

    /// Start the scheduler. Idempotent while running.
    pub fn start(&self) {
        self.launch();
        self.inner.scheduler.start();
    }

    /// Stop the scheduler and reset the hub.
    pub async fn stop(&self) {
        self.inner.scheduler.stop().await;
    }

    /// Full shutdown: scheduler, hub, staging, address book, and the
    /// background tasks.
    pub async fn close(&self) -> Result<(), ConnError> {
        self.inner.scheduler.stop().await;
        self.inner.hub.close().await;
        self.inner.staging.close();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.db.close()?;
        Ok(())
    }

    /// Durably remember a peer. The address must carry a key.
    pub fn remember(&self, addr: Address, mut data: PeerRecord) -> Result<(), ConnError> {
        let Some(key) = addr.key().copied() else {
            return Err(AddressError::MissingKey(addr.to_string()).into());
        };
        if data.key.is_none() {
            data.key = Some(key);
        }
        if data.host.is_none() {
            data.host = addr.host().map(str::to_string);
        }
        if data.port.is_none() {
            data.port = addr.port();
        }
        if data.source.is_none() {
            data.source = Some(Source::Manual);
        }
        self.inner.db.set(addr, data)?;
        Ok(())
    }

    /// Forget a peer from the address book.
    pub fn forget(&self, addr: &Address) -> Result<(), ConnError> {
        self.inner.db.delete(addr)?;
        Ok(())
    }

    /// Snapshot of the address book.
    pub fn db_peers(&self) -> Vec<(Address, PeerRecord)> {
        self.inner.db.entries()
    }

    /// Dial an address; completes with the dial outcome.
    pub async fn connect(
        &self,
        addr: Address,
        data: Option<PeerRecord>,
    ) -> Result<(), ConnError> {
        self.inner.hub.connect(addr, data).await?;
        Ok(())
    }

    /// Tear down a connection; idempotent.
    pub async fn disconnect(&self, addr: &Address) -> Result<(), ConnError> {
        self.inner.hub.disconnect(addr).await?;
        Ok(())
    }

    /// Live hub entries, re-emitted in full on every change.
    pub fn peers(&self) -> watch::Receiver<Vec<(Address, HubEntry)>> {
        self.inner.hub.live_entries()
    }

    /// Hub lifecycle event stream.
    pub fn listen(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.hub.listen()
    }

    /// Stage a discovered candidate.
    pub fn stage(&self, addr: Address, data: PeerRecord) -> bool {
        self.inner.staging.stage(addr, data)
    }

    /// Remove a staged candidate.
    pub fn unstage(&self, addr: &Address) -> bool {
        self.inner.staging.unstage(addr)
    }

    /// Snapshot of the staged candidates.
    pub fn staged_peers(&self) -> Vec<(Address, PeerRecord)> {
        self.inner.staging.entries()
    }

    /// The read-only joined view.
    pub fn query(&self) -> &Query {
        &self.inner.query
    }

    /// Heartbeat parameters for the RPC layer, clamped to the accepted
    /// range.
    pub fn ping(&self) -> Ping {
        Ping::new(self.inner.config.ping_timeout)
    }

    /// First known address for an identity.
    pub fn id_to_addr(&self, id: &FeedId) -> Result<Address, ConnError> {
        self.inner
            .db
            .get_address_for_id(id)
            .ok_or(ConnError::UnknownPeer(*id))
    }

    /// The process resumed from sleep.
    pub async fn on_wakeup(&self) {
        self.inner.scheduler.on_wakeup().await;
    }

    /// The machine's network configuration changed.
    pub async fn on_network_change(&self) {
        self.inner.scheduler.on_network_change().await;
    }

    /// Deprecated entry points, delegating to this core.
    pub fn legacy(&self) -> LegacyGossip {
        LegacyGossip::new(self.clone())
    }

    pub fn db(&self) -> &AddressBook {
        &self.inner.db
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn staging(&self) -> &Staging {
        &self.inner.staging
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }
}
