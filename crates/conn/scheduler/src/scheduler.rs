//! The control loop: tick scheduling, staging maintenance, and the
//! per-class quota engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tangle_conn_db::AddressBook;
use tangle_conn_hub::{ConnectionState, Hub, HubEvent, HubEventKind};
use tangle_conn_query::{Origin, PeerQuery, Query};
use tangle_conn_staging::Staging;
use tangle_peer::{Address, Clock, PeerClass, PeerRecord, Source};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::capabilities::{Capabilities, Discovery, MessageLog, SocialGraph};
use crate::classes::{self, ClassPolicy};
use crate::net::{can_be_connected, is_local, CachedNetwork};

/// Default tick period; the actual delay is fuzzed to `period * (0.5 + U[0,1))`.
const TICK_PERIOD: Duration = Duration::from_millis(1000);
/// Steady re-tick interval while running.
const STEADY_INTERVAL: Duration = Duration::from_secs(2);
/// Tick delay after observing a disconnect.
const DISCONNECT_TICK_DELAY: Duration = Duration::from_millis(200);
/// A log message this recent means a download is in progress.
const DOWNLOAD_QUIET_MS: u64 = 500;
/// Staged LAN candidates expire after this long.
const LAN_STAGING_MAX_AGE_MS: u64 = 10_000;
/// Staged Bluetooth candidates expire after this long.
const BT_STAGING_MAX_AGE_MS: u64 = 30_000;
/// In-connection peers that are neither permanent nor progressing get
/// this long before being cut.
const FRUSTRATING_AGE_MS: u64 = 10_000;
/// Internet connections are recycled after an hour.
const MAX_CONNECTION_AGE_MS: u64 = 60 * 60 * 1000;
/// Staged followed peers promoted per tick.
const FOLLOWED_PROMOTIONS: usize = 5;
/// Chance of shuffling candidates instead of oldest-first ordering.
const SHUFFLE_CHANCE: f64 = 0.3;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Run the seed class (dial configured seeds).
    pub seed_class: bool,
    /// Consume pub announcements from the message log.
    pub pub_discovery: bool,
    /// Remember discovered pubs in the address book.
    pub auto_populate: bool,
    /// Seed addresses pre-populated into the address book on start.
    pub seeds: Vec<Address>,
    /// Seed for the scheduling RNG; None draws from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            seed_class: true,
            pub_discovery: true,
            auto_populate: true,
            seeds: Vec::new(),
            rng_seed: None,
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    closed: bool,
    tick_scheduled: bool,
}

pub(crate) struct Inner {
    pub(crate) db: AddressBook,
    pub(crate) hub: Hub,
    pub(crate) staging: Staging,
    pub(crate) query: Query,
    pub(crate) graph: Arc<dyn SocialGraph>,
    pub(crate) network: CachedNetwork,
    pub(crate) log: Arc<dyn MessageLog>,
    pub(crate) config: SchedulerConfig,
    pub(crate) clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    state: Mutex<RunState>,
    tick_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    discovery: Mutex<Option<Discovery>>,
}

/// Policy-driven control loop over the three pools.
///
/// All tick work runs on one mailbox task, so a tick is never interleaved
/// with another tick.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Scheduler { .. }")
    }
}

impl Scheduler {
    pub fn new(
        db: AddressBook,
        hub: Hub,
        staging: Staging,
        capabilities: Capabilities,
        discovery: Discovery,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let query = Query::new(db.clone(), hub.clone(), staging.clone());
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            inner: Arc::new(Inner {
                db,
                hub,
                staging,
                query,
                graph: capabilities.social_graph,
                network: CachedNetwork::new(capabilities.network),
                log: capabilities.message_log,
                config,
                clock,
                rng: Mutex::new(rng),
                state: Mutex::new(RunState::default()),
                tick_tx: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                discovery: Mutex::new(Some(discovery)),
            }),
        }
    }

    /// Start the control loop. Idempotent while already running.
    ///
    /// Purges non-durable records, populates configured seeds, wires the
    /// discovery streams and hub reactions, and schedules the first tick.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.running || state.closed {
                return;
            }
            state.running = true;
        }

        self.purge_non_durable();
        self.populate_seeds();

        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        *self.inner.tick_tx.lock() = Some(tick_tx);

        let mut tasks = vec![
            tokio::spawn(self.clone().run_ticks(tick_rx)),
            tokio::spawn(self.clone().run_hub_listener(self.inner.hub.listen())),
            tokio::spawn(self.clone().run_steady_interval()),
        ];

        let discovery = self.inner.discovery.lock().take();
        if let Some(discovery) = discovery {
            if let Some(rx) = discovery.pubs {
                if self.inner.config.pub_discovery && self.inner.config.auto_populate {
                    tasks.push(tokio::spawn(self.clone().run_pub_intake(rx)));
                }
            }
            if let Some(rx) = discovery.lan {
                tasks.push(tokio::spawn(self.clone().run_lan_intake(rx)));
            }
            if let Some(rx) = discovery.bt {
                tasks.push(tokio::spawn(self.clone().run_bt_intake(rx)));
            }
        }

        self.inner.tasks.lock().extend(tasks);
        self.update_soon();
        debug!("scheduler started");
    }

    /// Stop discovery, reset the hub, and refuse further ticks.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.running = false;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.hub.reset().await;
        debug!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        let state = self.inner.state.lock();
        state.running && !state.closed
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Schedule a tick roughly one period from now. Redundant calls while
    /// a tick is pending collapse into one; a closed scheduler drops the
    /// call silently.
    pub fn update_soon(&self) {
        self.update_soon_in(TICK_PERIOD);
    }

    /// [`update_soon`](Self::update_soon) with an explicit period. The
    /// actual delay is fuzzed to `period * (0.5 + U[0,1))` so meshes of
    /// peers running the same loop do not lock step.
    pub fn update_soon_in(&self, period: Duration) {
        {
            let mut state = self.inner.state.lock();
            if state.closed || !state.running || state.tick_scheduled {
                return;
            }
            state.tick_scheduled = true;
        }
        let fuzz: f64 = self.inner.rng.lock().gen();
        let delay = period.mul_f64(0.5 + fuzz);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.inner.state.lock().tick_scheduled = false;
            let tx = this.inner.tick_tx.lock();
            if let Some(tx) = tx.as_ref() {
                let _ = tx.send(());
            }
        });
    }

    async fn run_ticks(self, mut rx: mpsc::UnboundedReceiver<()>) {
        while rx.recv().await.is_some() {
            if self.is_closed() {
                break;
            }
            self.update_now().await;
        }
    }

    async fn run_steady_interval(self) {
        let mut interval = tokio::time::interval(STEADY_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            if self.is_closed() {
                break;
            }
            self.update_soon();
        }
    }

    /// Run one maintenance pass now, unless suppressed.
    ///
    /// Suppressed while the message log is not ready, while a download
    /// appears to be in progress, or while the hops table is loading.
    pub async fn update_now(&self) {
        if self.is_closed() {
            return;
        }
        if !self.inner.log.ready() {
            trace!("tick suppressed: message log not ready");
            return;
        }
        let now = self.inner.clock.now_ms();
        if let Some(last) = self.inner.log.last_message_ms() {
            if now.saturating_sub(last) < DOWNLOAD_QUIET_MS {
                trace!("tick suppressed: download in progress");
                return;
            }
        }
        if !self.inner.graph.ready() {
            trace!("tick suppressed: hops table loading");
            return;
        }
        self.update_staging();
        self.update_hub().await;
    }

    /// Staging maintenance: stage autoconnect=false records, purge blocked
    /// candidates, and age out LAN/Bluetooth entries.
    fn update_staging(&self) {
        let now = self.inner.clock.now_ms();

        for (addr, record) in self.inner.db.entries() {
            if !record.autoconnect() && !self.blocked(&record) {
                self.inner.staging.stage(addr, record);
            }
        }

        for (addr, record) in self.inner.staging.entries() {
            if self.blocked(&record) {
                debug!(address = %addr, "unstaging blocked peer");
                self.inner.staging.unstage(&addr);
                continue;
            }
            let age = now.saturating_sub(record.staging_updated.unwrap_or(now));
            let expired = match record.class {
                Some(PeerClass::Lan) => age > LAN_STAGING_MAX_AGE_MS,
                Some(PeerClass::Bt) => age > BT_STAGING_MAX_AGE_MS,
                _ => false,
            };
            if expired {
                trace!(address = %addr, "staged candidate expired");
                self.inner.staging.unstage(&addr);
            }
        }
    }

    /// The quota engine: one pass per class, then the cross-class sweeps.
    async fn update_hub(&self) {
        if self.inner.config.seed_class {
            self.update_class(&classes::SEED, &classes::is_seed).await;
        }
        if self.inner.query.peers_in_connection().is_empty() {
            self.update_class(&classes::ANY_WHEN_EMPTY, &|_: &PeerRecord| true)
                .await;
        }
        self.update_class(&classes::ROOM, &classes::is_room).await;
        self.update_class(&classes::PINGED, &PeerRecord::has_pinged)
            .await;
        self.update_class(&classes::NO_ATTEMPTS, &PeerRecord::has_no_attempts)
            .await;
        self.update_class(&classes::ONLY_FAILED, &PeerRecord::has_only_failed_attempts)
            .await;
        self.update_class(&classes::LEGACY, &PeerRecord::is_legacy)
            .await;

        self.promote_followed_staged();
        self.disconnect_blocked().await;
        self.disconnect_frustrating().await;
        self.disconnect_old_connections().await;
    }

    /// Enforce one class's quota: shed excess, then fill free slots from
    /// the connectable candidates that pass debounce and backoff.
    async fn update_class(
        &self,
        policy: &ClassPolicy,
        pred: &(dyn Fn(&PeerRecord) -> bool + Sync),
    ) {
        let now = self.inner.clock.now_ms();
        let up = self
            .inner
            .query
            .peers_in_connection()
            .filter(|_, r| pred(r));
        let down = self
            .inner
            .query
            .peers_connectable(Origin::Db)
            .filter(|_, r| pred(r));

        if up.len() > 2 * policy.quota {
            let excess = up.len() - policy.quota;
            let victims = up.clone().sort_by_state_change().take(excess);
            for (addr, _) in victims {
                debug!(class = policy.name, address = %addr, "disconnecting excess peer");
                let _ = self.inner.hub.disconnect(&addr).await;
            }
        }

        let mut free = policy.quota.saturating_sub(up.len());
        // A single free slot would produce one peer failing to reconnect
        // over and over; open a second.
        if free == 1 {
            free = 2;
        }
        if free == 0 {
            return;
        }

        // Fresh per class pass: dials from earlier classes this tick must
        // already count against their groups.
        let activity = self.inner.query.group_activity();
        let candidates = down
            .filter(|_, r| !self.blocked(r))
            .filter(|_, r| can_be_connected(r, &self.inner.network))
            .filter(|_, r| r.autoconnect())
            .group_debounce(now, policy.group_min.as_millis() as u64, &activity)
            .exp_backoff(now, policy.backoff_step, policy.backoff_max);

        let picked = self.order_candidates(candidates).take(free);
        for (addr, record) in picked {
            debug!(class = policy.name, address = %addr, "dialing");
            if let Err(e) = self.inner.hub.begin_connect(addr, Some(record)) {
                trace!(error = %e, "dial not started");
            }
        }
    }

    /// Mostly oldest-first, occasionally shuffled so the mesh does not
    /// fixate on the same candidates.
    fn order_candidates(&self, candidates: PeerQuery) -> PeerQuery {
        let mut rng = self.inner.rng.lock();
        if rng.gen::<f64>() < SHUFFLE_CHANCE {
            candidates.shuffle(&mut *rng)
        } else {
            candidates.sort_by_state_change()
        }
    }

    /// Dial up to [`FOLLOWED_PROMOTIONS`] staged peers we follow directly.
    fn promote_followed_staged(&self) {
        let picked = self
            .inner
            .query
            .peers_connectable(Origin::Staging)
            .filter(|_, r| self.followed(r))
            .take(FOLLOWED_PROMOTIONS);
        for (addr, record) in picked {
            debug!(address = %addr, "promoting followed staged peer");
            if let Err(e) = self.inner.hub.begin_connect(addr, Some(record)) {
                trace!(error = %e, "promotion not started");
            }
        }
    }

    async fn disconnect_blocked(&self) {
        for (addr, record) in self.inner.query.peers_in_connection() {
            if self.blocked(&record) {
                debug!(address = %addr, "disconnecting blocked peer");
                let _ = self.inner.hub.disconnect(&addr).await;
            }
        }
    }

    /// Cut in-connection peers that are neither permanent (pinged or on
    /// the local network) nor progressing, once they are stale.
    async fn disconnect_frustrating(&self) {
        let now = self.inner.clock.now_ms();
        for (addr, entry) in self.inner.hub.entries() {
            if !entry.state.is_in_connection() {
                continue;
            }
            let permanent = entry.record.has_pinged() || is_local(&entry.record);
            let stuck = entry.state == ConnectionState::Connecting;
            let stale = entry
                .record
                .state_change
                .map(|t| t + FRUSTRATING_AGE_MS < now)
                .unwrap_or(false);
            if (!permanent || stuck) && stale {
                debug!(address = %addr, state = ?entry.state, "disconnecting frustrating peer");
                let _ = self.inner.hub.disconnect(&addr).await;
            }
        }
    }

    /// Recycle internet connections that have been up for over an hour.
    async fn disconnect_old_connections(&self) {
        let now = self.inner.clock.now_ms();
        for (addr, entry) in self.inner.hub.entries() {
            if !entry.state.is_in_connection() {
                continue;
            }
            let internet = !matches!(
                entry.record.class,
                Some(PeerClass::Bt) | Some(PeerClass::Lan)
            );
            let old = entry
                .record
                .state_change
                .map(|t| t + MAX_CONNECTION_AGE_MS < now)
                .unwrap_or(false);
            if internet && old {
                debug!(address = %addr, "recycling long-lived connection");
                let _ = self.inner.hub.disconnect(&addr).await;
            }
        }
    }

    /// Records that must be rediscovered rather than remembered.
    fn purge_non_durable(&self) {
        for (addr, record) in self.inner.db.entries() {
            let ephemeral_source = matches!(record.source, Some(Source::Local) | Some(Source::Bt));
            let ephemeral_class =
                matches!(record.class, Some(PeerClass::Lan) | Some(PeerClass::Bt));
            if ephemeral_source || ephemeral_class {
                debug!(address = %addr, "purging non-durable record");
                let _ = self.inner.db.delete(&addr);
            }
        }
    }

    fn populate_seeds(&self) {
        for seed in self.inner.config.seeds.clone() {
            let record = PeerRecord {
                key: seed.key().copied(),
                host: seed.host().map(str::to_string),
                port: seed.port(),
                source: Some(Source::Seed),
                ..Default::default()
            };
            if let Err(e) = self.inner.db.set(seed, record) {
                warn!(error = %e, "failed to remember seed");
            }
        }
    }

    /// External triggers.
    ///
    /// Both wakeup and a network change invalidate every connection; the
    /// resulting disconnect events re-schedule a quick tick.
    pub async fn on_wakeup(&self) {
        debug!("wakeup: resetting hub");
        self.inner.hub.reset().await;
    }

    pub async fn on_network_change(&self) {
        debug!("network change: resetting hub");
        self.inner.hub.reset().await;
    }

    async fn run_hub_listener(self, mut rx: broadcast::Receiver<HubEvent>) {
        let mut connected_at: HashMap<Address, u64> = HashMap::new();
        loop {
            match rx.recv().await {
                Ok(event) => self.on_hub_event(&event, &mut connected_at),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "hub event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Fold one hub transition into the address book's rolling statistics.
    pub(crate) fn on_hub_event(
        &self,
        event: &HubEvent,
        connected_at: &mut HashMap<Address, u64>,
    ) {
        let now = self.inner.clock.now_ms();
        let addr = &event.address;
        match event.kind {
            HubEventKind::Connecting => {
                self.db_update(addr, |record| {
                    record.state_change = Some(now);
                });
            }
            HubEventKind::Connected => {
                connected_at.insert(addr.clone(), now);
                self.db_update(addr, |record| {
                    record.failure = Some(0);
                    record.state_change = Some(now);
                });
            }
            HubEventKind::ConnectingFailed => {
                self.db_update(addr, |record| {
                    record.failure = Some(record.failures() + 1);
                    record.state_change = Some(now);
                });
            }
            HubEventKind::Disconnected => {
                let connected_since = connected_at.remove(addr);
                self.db_update(addr, |record| {
                    if let Some(t0) = connected_since {
                        let mut duration = record.duration.unwrap_or_default();
                        duration.update(now.saturating_sub(t0) as f64);
                        record.duration = Some(duration);
                    }
                    record.state_change = Some(now);
                });
                self.update_soon_in(DISCONNECT_TICK_DELAY);
            }
        }
    }

    fn db_update(&self, addr: &Address, apply: impl FnOnce(&mut PeerRecord)) {
        let Some(mut record) = self.inner.db.get(addr) else {
            return;
        };
        apply(&mut record);
        if let Err(e) = self.inner.db.set(addr.clone(), record) {
            warn!(error = %e, "address book update failed");
        }
    }

    pub(crate) fn blocked(&self, record: &PeerRecord) -> bool {
        record
            .key
            .map(|k| {
                self.inner
                    .graph
                    .hops(&k)
                    .map(|h| h < 0.0)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub(crate) fn followed(&self, record: &PeerRecord) -> bool {
        record
            .key
            .map(|k| {
                self.inner
                    .graph
                    .hops(&k)
                    .map(|h| h > 0.0 && h <= 1.0)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tangle_conn_db::MemoryStore;
    use tangle_conn_hub::{Connection, DialError, Dialer};
    use tangle_conn_staging::LivenessProbe;
    use tangle_peer::{FeedId, ManualClock, RollingStats};

    use super::*;
    use crate::capabilities::{NoMessageLog, NoSocialGraph};

    fn key(b: u8) -> FeedId {
        FeedId::new([b; 32])
    }

    fn addr(b: u8) -> Address {
        Address::net(format!("host{b}.example.com"), 8008, key(b))
    }

    struct NoopConnection;

    #[async_trait]
    impl Connection for NoopConnection {
        async fn close(self: Box<Self>) {}
    }

    /// Dialer counting attempts; fails while `failing` is set.
    struct CountingDialer {
        dials: AtomicUsize,
        failing: AtomicBool,
    }

    impl CountingDialer {
        fn new(failing: bool) -> Arc<Self> {
            Arc::new(Self {
                dials: AtomicUsize::new(0),
                failing: AtomicBool::new(failing),
            })
        }

        fn count(&self) -> usize {
            self.dials.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(
            &self,
            _addr: &Address,
            _record: &PeerRecord,
        ) -> Result<Box<dyn Connection>, DialError> {
            self.dials.fetch_add(1, Ordering::Relaxed);
            if self.failing.load(Ordering::Relaxed) {
                Err(DialError::Transport("connection refused".into()))
            } else {
                Ok(Box::new(NoopConnection))
            }
        }
    }

    /// Hops table the tests mutate mid-flight.
    #[derive(Default)]
    struct TestGraph {
        hops: Mutex<HashMap<FeedId, f64>>,
    }

    impl SocialGraph for TestGraph {
        fn hops(&self, key: &FeedId) -> Option<f64> {
            self.hops.lock().get(key).copied()
        }
    }

    struct HubProbe(Hub);

    impl LivenessProbe for HubProbe {
        fn is_live(&self, addr: &Address) -> bool {
            self.0
                .get_state(addr)
                .map(|s| s.is_in_connection())
                .unwrap_or(false)
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        db: AddressBook,
        hub: Hub,
        staging: Staging,
        clock: ManualClock,
        dialer: Arc<CountingDialer>,
        graph: Arc<TestGraph>,
    }

    fn fixture_with(config: SchedulerConfig, failing: bool) -> Fixture {
        let clock = ManualClock::new(1_000_000);
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let dialer = CountingDialer::new(failing);
        let hub = Hub::new(dialer.clone(), clock_arc.clone());
        let staging = Staging::new(Arc::new(HubProbe(hub.clone())), clock_arc.clone());
        let db = AddressBook::open(MemoryStore::new()).unwrap();
        let graph = Arc::new(TestGraph::default());
        let capabilities = Capabilities {
            social_graph: graph.clone(),
            network: Arc::new(crate::capabilities::AlwaysOnline),
            message_log: Arc::new(NoMessageLog),
        };
        let scheduler = Scheduler::new(
            db.clone(),
            hub.clone(),
            staging.clone(),
            capabilities,
            Discovery::default(),
            config,
            clock_arc,
        );
        Fixture {
            scheduler,
            db,
            hub,
            staging,
            clock,
            dialer,
            graph,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            SchedulerConfig {
                rng_seed: Some(7),
                ..Default::default()
            },
            false,
        )
    }

    /// Let spawned dial tasks run to completion.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_purges_non_durable_records() {
        let f = fixture();
        f.db.set(
            addr(1),
            PeerRecord {
                key: Some(key(1)),
                source: Some(Source::Local),
                ..Default::default()
            },
        )
        .unwrap();
        f.db.set(
            addr(2),
            PeerRecord {
                key: Some(key(2)),
                class: Some(PeerClass::Bt),
                ..Default::default()
            },
        )
        .unwrap();
        f.db.set(addr(3), PeerRecord::with_key(key(3))).unwrap();

        f.scheduler.start();
        assert!(!f.db.has(&addr(1)));
        assert!(!f.db.has(&addr(2)));
        assert!(f.db.has(&addr(3)));

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_populates_seeds() {
        let seed = addr(9);
        let f = fixture_with(
            SchedulerConfig {
                seeds: vec![seed.clone()],
                rng_seed: Some(7),
                ..Default::default()
            },
            false,
        );
        f.scheduler.start();
        f.scheduler.start();

        let record = f.db.get(&seed).unwrap();
        assert_eq!(record.source, Some(Source::Seed));
        assert_eq!(record.key, Some(key(9)));

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_first_tick_dials_seed() {
        let seed = addr(9);
        let f = fixture_with(
            SchedulerConfig {
                seeds: vec![seed.clone()],
                rng_seed: Some(7),
                ..Default::default()
            },
            false,
        );
        f.scheduler.start();
        f.scheduler.update_now().await;
        settle().await;

        assert_eq!(f.hub.get_state(&seed), Some(ConnectionState::Connected));
        assert_eq!(f.dialer.count(), 1);

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_never_just_one_opens_two_slots() {
        let f = fixture();
        // One pinged peer in connection leaves quota 2 with a single free
        // slot; the engine must open two.
        let pinged = |b: u8| {
            let mut ping = RollingStats::default();
            ping.update(100.0);
            PeerRecord {
                key: Some(key(b)),
                host: Some(format!("host{b}.example.com")),
                ping: Some(ping),
                // An old attempt keeps these out of the no-attempts class.
                state_change: Some(1),
                ..Default::default()
            }
        };
        f.hub.connect(addr(1), Some(pinged(1))).await.unwrap();
        for b in 2..=6 {
            f.db.set(addr(b), pinged(b)).unwrap();
        }

        f.scheduler.update_now().await;
        settle().await;

        let in_connection = f
            .hub
            .entries()
            .iter()
            .filter(|(_, e)| e.state.is_in_connection())
            .count();
        assert_eq!(in_connection, 3);

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_excess_peers_disconnected_to_quota() {
        let f = fixture();
        let pinged = |b: u8| {
            let mut ping = RollingStats::default();
            ping.update(100.0);
            PeerRecord {
                key: Some(key(b)),
                host: Some(format!("host{b}.example.com")),
                ping: Some(ping),
                ..Default::default()
            }
        };
        // 5 pinged peers in connection against a quota of 2.
        for b in 1..=5 {
            f.clock.advance(1_000);
            f.hub.connect(addr(b), Some(pinged(b))).await.unwrap();
        }

        f.scheduler.update_now().await;
        settle().await;

        let up: Vec<Address> = f
            .hub
            .entries()
            .iter()
            .filter(|(_, e)| e.state.is_in_connection())
            .map(|(a, _)| a.clone())
            .collect();
        assert_eq!(up.len(), 2);
        // The oldest three were shed.
        assert!(!up.contains(&addr(1)));
        assert!(!up.contains(&addr(2)));
        assert!(!up.contains(&addr(3)));

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_backoff_holds_failed_candidate() {
        let f = fixture_with(
            SchedulerConfig {
                rng_seed: Some(7),
                ..Default::default()
            },
            true,
        );
        // Not started: hub events are fed back by hand below so the test
        // controls exactly when statistics land in the address book.
        f.db.set(
            addr(9),
            PeerRecord {
                key: Some(key(9)),
                host: Some("host9.example.com".into()),
                source: Some(Source::Seed),
                ..Default::default()
            },
        )
        .unwrap();
        let mut events = f.hub.listen();

        f.scheduler.update_now().await;
        settle().await;
        assert_eq!(f.dialer.count(), 1);

        // Feed the failure back the way the listener task does.
        let mut connected_at = HashMap::new();
        loop {
            let event = events.try_recv().unwrap();
            let done = event.kind == HubEventKind::ConnectingFailed;
            f.scheduler.on_hub_event(&event, &mut connected_at);
            if done {
                break;
            }
        }
        assert_eq!(f.db.get(&addr(9)).unwrap().failures(), 1);

        // Within the shortest applicable backoff window (the any-class
        // step of 1s doubles to 2s after one failure): no redial.
        f.clock.advance(1_999);
        f.scheduler.update_now().await;
        settle().await;
        assert_eq!(f.dialer.count(), 1);

        // Past the window the candidate is eligible again.
        f.clock.advance(200);
        f.scheduler.update_now().await;
        settle().await;
        assert_eq!(f.dialer.count(), 2);

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_tick_disconnects_blocked_peer() {
        let f = fixture();
        f.db.set(addr(1), PeerRecord::with_key(key(1))).unwrap();
        f.hub.connect(addr(1), None).await.unwrap();
        f.staging.stage(addr(2), PeerRecord::with_key(key(2)));

        f.graph.hops.lock().insert(key(1), -1.0);
        f.graph.hops.lock().insert(key(2), -1.0);

        f.scheduler.update_now().await;
        settle().await;

        assert_eq!(f.hub.get_state(&addr(1)), None);
        assert!(f.staging.get(&addr(2)).is_none());

        // Blocked peers are never redialed.
        f.clock.advance(60_000);
        f.scheduler.update_now().await;
        settle().await;
        assert_eq!(f.hub.get_state(&addr(1)), None);

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_staged_lan_candidates_age_out() {
        let f = fixture();
        f.staging.stage(
            addr(1),
            PeerRecord {
                key: Some(key(1)),
                class: Some(PeerClass::Lan),
                ..Default::default()
            },
        );

        f.clock.advance(9_900);
        f.scheduler.update_now().await;
        assert!(f.staging.get(&addr(1)).is_some());

        f.clock.advance(200);
        f.scheduler.update_now().await;
        assert!(f.staging.get(&addr(1)).is_none());

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_staged_bt_candidates_age_out_slower() {
        let f = fixture();
        f.staging.stage(
            addr(1),
            PeerRecord {
                key: Some(key(1)),
                class: Some(PeerClass::Bt),
                ..Default::default()
            },
        );

        f.clock.advance(29_000);
        f.scheduler.update_now().await;
        assert!(f.staging.get(&addr(1)).is_some());

        f.clock.advance(2_000);
        f.scheduler.update_now().await;
        assert!(f.staging.get(&addr(1)).is_none());

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_autoconnect_false_records_get_staged() {
        let f = fixture();
        f.db.set(
            addr(1),
            PeerRecord {
                key: Some(key(1)),
                autoconnect: Some(false),
                ..Default::default()
            },
        )
        .unwrap();

        f.scheduler.update_now().await;
        assert!(f.staging.get(&addr(1)).is_some());

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_tick_suppressed_while_log_not_ready() {
        struct NotReadyLog;
        impl MessageLog for NotReadyLog {
            fn ready(&self) -> bool {
                false
            }
            fn last_message_ms(&self) -> Option<u64> {
                None
            }
        }

        let clock = ManualClock::new(0);
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let dialer = CountingDialer::new(false);
        let hub = Hub::new(dialer.clone(), clock_arc.clone());
        let staging = Staging::new(Arc::new(HubProbe(hub.clone())), clock_arc.clone());
        let db = AddressBook::open(MemoryStore::new()).unwrap();
        db.set(addr(1), PeerRecord::with_key(key(1))).unwrap();

        let scheduler = Scheduler::new(
            db,
            hub,
            staging,
            Capabilities {
                message_log: Arc::new(NotReadyLog),
                social_graph: Arc::new(NoSocialGraph),
                network: Arc::new(crate::capabilities::AlwaysOnline),
            },
            Discovery::default(),
            SchedulerConfig {
                rng_seed: Some(7),
                ..Default::default()
            },
            clock_arc,
        );

        scheduler.update_now().await;
        settle().await;
        assert_eq!(dialer.count(), 0);
    }

    #[tokio::test]
    async fn test_tick_suppressed_during_download() {
        struct BusyLog(ManualClock);
        impl MessageLog for BusyLog {
            fn last_message_ms(&self) -> Option<u64> {
                // A message arrived just now.
                Some(self.0.now_ms())
            }
        }

        let clock = ManualClock::new(1_000_000);
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let dialer = CountingDialer::new(false);
        let hub = Hub::new(dialer.clone(), clock_arc.clone());
        let staging = Staging::new(Arc::new(HubProbe(hub.clone())), clock_arc.clone());
        let db = AddressBook::open(MemoryStore::new()).unwrap();
        db.set(addr(1), PeerRecord::with_key(key(1))).unwrap();

        let scheduler = Scheduler::new(
            db,
            hub,
            staging,
            Capabilities {
                message_log: Arc::new(BusyLog(clock.clone())),
                social_graph: Arc::new(NoSocialGraph),
                network: Arc::new(crate::capabilities::AlwaysOnline),
            },
            Discovery::default(),
            SchedulerConfig {
                rng_seed: Some(7),
                ..Default::default()
            },
            clock_arc,
        );

        scheduler.update_now().await;
        settle().await;
        assert_eq!(dialer.count(), 0);
    }

    #[tokio::test]
    async fn test_quota_invariant_after_tick() {
        let f = fixture();
        // Plenty of never-attempted candidates: the any-when-empty class
        // opens 2 (never-just-one) and the no-attempts class tops up to
        // its quota; the total stays within twice the largest quota.
        for b in 1..=10 {
            f.db.set(addr(b), PeerRecord::with_key(key(b))).unwrap();
        }

        f.scheduler.update_now().await;
        settle().await;

        let in_connection = f
            .hub
            .entries()
            .iter()
            .filter(|(_, e)| e.state.is_in_connection())
            .count();
        assert!(in_connection <= 4, "dialed {in_connection}");
        assert!(in_connection >= 2);

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_frustrating_connecting_peer_is_cut() {
        // A dialer that never resolves leaves the entry in Connecting.
        struct StuckDialer;
        #[async_trait]
        impl Dialer for StuckDialer {
            async fn dial(
                &self,
                _addr: &Address,
                _record: &PeerRecord,
            ) -> Result<Box<dyn Connection>, DialError> {
                std::future::pending().await
            }
        }

        let clock = ManualClock::new(1_000_000);
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let hub = Hub::new(Arc::new(StuckDialer), clock_arc.clone());
        let staging = Staging::new(Arc::new(HubProbe(hub.clone())), clock_arc.clone());
        let db = AddressBook::open(MemoryStore::new()).unwrap();
        let scheduler = Scheduler::new(
            db,
            hub.clone(),
            staging,
            Capabilities::default(),
            Discovery::default(),
            SchedulerConfig {
                rng_seed: Some(7),
                ..Default::default()
            },
            clock_arc,
        );

        let _rx = hub.begin_connect(addr(1), None).unwrap();
        assert_eq!(hub.get_state(&addr(1)), Some(ConnectionState::Connecting));

        // Not yet stale.
        clock.advance(9_000);
        scheduler.update_now().await;
        assert_eq!(hub.get_state(&addr(1)), Some(ConnectionState::Connecting));

        clock.advance(2_000);
        scheduler.update_now().await;
        assert_eq!(hub.get_state(&addr(1)), None);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_long_lived_internet_connection_recycled() {
        let f = fixture();
        let mut ping = RollingStats::default();
        ping.update(50.0);
        // Pinged (permanent) so the frustrating sweep leaves it alone.
        f.hub
            .connect(
                addr(1),
                Some(PeerRecord {
                    key: Some(key(1)),
                    ping: Some(ping),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        f.clock.advance(59 * 60 * 1000);
        f.scheduler.update_now().await;
        settle().await;
        assert_eq!(f.hub.get_state(&addr(1)), Some(ConnectionState::Connected));

        f.clock.advance(2 * 60 * 1000);
        f.scheduler.update_now().await;
        settle().await;
        assert_eq!(f.hub.get_state(&addr(1)), None);

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_followed_staged_peers_promoted() {
        let f = fixture();
        for b in 1..=7 {
            f.graph.hops.lock().insert(key(b), 1.0);
            f.staging.stage(addr(b), PeerRecord::with_key(key(b)));
        }
        // An unfollowed candidate stays put.
        f.staging.stage(addr(8), PeerRecord::with_key(key(8)));

        f.scheduler.update_now().await;
        settle().await;

        let dialed = f
            .hub
            .entries()
            .iter()
            .filter(|(_, e)| e.state.is_in_connection())
            .count();
        assert_eq!(dialed, 5);
        assert!(f.staging.get(&addr(8)).is_some());

        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_closed_scheduler_drops_update_soon() {
        let f = fixture();
        f.scheduler.start();
        f.scheduler.stop().await;
        // No panic, no effect.
        f.scheduler.update_soon();
        f.scheduler.update_now().await;
        assert_eq!(f.dialer.count(), 0);
    }
}
