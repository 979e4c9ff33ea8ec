//! Host reachability predicates over peer records.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tangle_peer::{PeerClass, PeerRecord, Source};

use crate::capabilities::NetworkMonitor;

/// How long one `has_network()` answer is reused.
const NETWORK_CACHE_TTL: Duration = Duration::from_secs(1);

fn parse_host(record: &PeerRecord) -> Option<IpAddr> {
    record.host.as_deref().and_then(|h| h.parse().ok())
}

fn host_is_loopback(record: &PeerRecord) -> bool {
    match record.host.as_deref() {
        Some("localhost") => true,
        _ => parse_host(record).map(|ip| ip.is_loopback()).unwrap_or(false),
    }
}

fn host_is_private(record: &PeerRecord) -> bool {
    match parse_host(record) {
        Some(IpAddr::V4(ip)) => ip.is_private() || ip.is_link_local(),
        Some(IpAddr::V6(ip)) => (ip.segments()[0] & 0xfe00) == 0xfc00,
        None => false,
    }
}

/// Loopback hosts are always connectable; anything else needs the network
/// monitor to report a usable network.
pub fn can_be_connected(record: &PeerRecord, network: &CachedNetwork) -> bool {
    host_is_loopback(record) || network.has_network()
}

/// A peer on our own network: non-loopback, privately routable, and
/// discovered locally (source `local` or class `lan`).
pub fn is_local(record: &PeerRecord) -> bool {
    !host_is_loopback(record)
        && host_is_private(record)
        && (record.source == Some(Source::Local) || record.class == Some(PeerClass::Lan))
}

/// Caches the network monitor's answer for [`NETWORK_CACHE_TTL`] so a tick
/// over many candidates asks the monitor once.
pub struct CachedNetwork {
    monitor: Arc<dyn NetworkMonitor>,
    cached: Mutex<Option<(Instant, bool)>>,
}

impl std::fmt::Debug for CachedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CachedNetwork { .. }")
    }
}

impl CachedNetwork {
    pub fn new(monitor: Arc<dyn NetworkMonitor>) -> Self {
        Self {
            monitor,
            cached: Mutex::new(None),
        }
    }

    pub fn has_network(&self) -> bool {
        let mut cached = self.cached.lock();
        if let Some((at, answer)) = *cached {
            if at.elapsed() < NETWORK_CACHE_TTL {
                return answer;
            }
        }
        let answer = self.monitor.has_network();
        *cached = Some((Instant::now(), answer));
        answer
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn record(host: &str, source: Option<Source>, class: Option<PeerClass>) -> PeerRecord {
        PeerRecord {
            host: Some(host.to_string()),
            source,
            class,
            ..Default::default()
        }
    }

    #[test]
    fn test_loopback_always_connectable() {
        struct Offline;
        impl NetworkMonitor for Offline {
            fn has_network(&self) -> bool {
                false
            }
        }
        let network = CachedNetwork::new(Arc::new(Offline));

        assert!(can_be_connected(&record("127.0.0.1", None, None), &network));
        assert!(can_be_connected(&record("localhost", None, None), &network));
        assert!(!can_be_connected(&record("203.0.113.5", None, None), &network));
    }

    #[test]
    fn test_is_local() {
        assert!(is_local(&record(
            "192.168.1.5",
            Some(Source::Local),
            None
        )));
        assert!(is_local(&record("10.0.0.7", None, Some(PeerClass::Lan))));

        // Loopback is not "local network".
        assert!(!is_local(&record("127.0.0.1", Some(Source::Local), None)));
        // Public address is not local even if claimed.
        assert!(!is_local(&record("203.0.113.5", Some(Source::Local), None)));
        // Private address without a local source/class is not local.
        assert!(!is_local(&record("192.168.1.5", None, None)));
    }

    #[test]
    fn test_network_answer_is_cached() {
        struct Counting(AtomicUsize);
        impl NetworkMonitor for Counting {
            fn has_network(&self) -> bool {
                self.0.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
        let monitor = Arc::new(Counting(AtomicUsize::new(0)));
        let network = CachedNetwork::new(monitor.clone());

        for _ in 0..10 {
            assert!(network.has_network());
        }
        assert_eq!(monitor.0.load(Ordering::Relaxed), 1);
    }
}
