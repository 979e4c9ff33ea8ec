//! Cross-pool invariant enforcement.
//!
//! An address must never be live in the hub and staged at the same time:
//! hub `connecting`/`connected` transitions unstage the address, and a
//! staging insertion that races a dial is rolled back.

use tangle_conn_hub::{Hub, HubEventKind};
use tangle_conn_staging::{Staging, StagingEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{trace, warn};

pub(crate) async fn run_glue(hub: Hub, staging: Staging) {
    let mut hub_events = hub.listen();
    let mut staging_events = staging.listen();

    loop {
        tokio::select! {
            event = hub_events.recv() => match event {
                Ok(event) => {
                    if matches!(event.kind, HubEventKind::Connecting | HubEventKind::Connected)
                        && staging.unstage(&event.address)
                    {
                        trace!(address = %event.address, "unstaged live address");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "interpool glue lagged on hub events");
                }
                Err(RecvError::Closed) => break,
            },
            event = staging_events.recv() => match event {
                Ok(StagingEvent::Staged { address }) => {
                    let live = hub
                        .get_state(&address)
                        .map(|s| s.is_in_connection())
                        .unwrap_or(false);
                    if live && staging.unstage(&address) {
                        trace!(address = %address, "rolled back staging of live address");
                    }
                }
                Ok(StagingEvent::Unstaged { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "interpool glue lagged on staging events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tangle_conn_hub::{Connection, DialError, Dialer};
    use tangle_conn_staging::NeverLive;
    use tangle_peer::{Address, FeedId, PeerRecord, SystemClock};

    use super::*;

    struct NoopConnection;

    #[async_trait::async_trait]
    impl Connection for NoopConnection {
        async fn close(self: Box<Self>) {}
    }

    struct OkDialer;

    #[async_trait::async_trait]
    impl Dialer for OkDialer {
        async fn dial(
            &self,
            _addr: &Address,
            _record: &PeerRecord,
        ) -> Result<Box<dyn Connection>, DialError> {
            Ok(Box::new(NoopConnection))
        }
    }

    fn addr(b: u8) -> Address {
        Address::net(format!("host{b}.example.com"), 8008, FeedId::new([b; 32]))
    }

    #[tokio::test]
    async fn test_dial_unstages_address() {
        let hub = Hub::new(Arc::new(OkDialer), Arc::new(SystemClock));
        let staging = Staging::new(Arc::new(NeverLive), Arc::new(SystemClock));
        let glue = tokio::spawn(run_glue(hub.clone(), staging.clone()));

        staging.stage(addr(1), PeerRecord::default());
        assert_eq!(staging.len(), 1);

        hub.connect(addr(1), None).await.unwrap();
        // Give the glue task a chance to observe the events.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(staging.get(&addr(1)).is_none());

        glue.abort();
    }

    #[tokio::test]
    async fn test_staging_race_rolled_back() {
        let hub = Hub::new(Arc::new(OkDialer), Arc::new(SystemClock));
        // NeverLive probe: staging itself will not refuse, so only the
        // glue can roll the insertion back.
        let staging = Staging::new(Arc::new(NeverLive), Arc::new(SystemClock));
        let glue = tokio::spawn(run_glue(hub.clone(), staging.clone()));

        hub.connect(addr(1), None).await.unwrap();
        staging.stage(addr(1), PeerRecord::default());

        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(staging.get(&addr(1)).is_none());

        glue.abort();
    }
}
