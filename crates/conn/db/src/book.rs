//! In-memory image of the address book with delayed durable writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tangle_peer::{Address, FeedId, PeerRecord};
use tracing::{debug, warn};

use crate::store::{RecordStore, StoreError};

/// Durable writes happen within this interval of the mutation.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

struct Inner {
    records: RwLock<HashMap<Address, PeerRecord>>,
    store: Box<dyn RecordStore>,
    dirty: Mutex<bool>,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if *self.dirty.lock() {
            let snapshot = self.records.read().clone();
            let _ = self.store.save_all(&snapshot);
        }
    }
}

/// Durable mapping `Address -> PeerRecord`.
///
/// Reads are synchronous against the in-memory image and reflect every
/// write in this process immediately; writes reach the store within
/// [`FLUSH_INTERVAL`] via [`run_flusher`](Self::run_flusher) or on
/// [`close`](Self::close).
#[derive(Clone)]
pub struct AddressBook {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AddressBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressBook")
            .field("len", &self.inner.records.read().len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl AddressBook {
    /// Open the book, loading the initial image from the store.
    pub fn open(store: impl RecordStore + 'static) -> Result<Self, StoreError> {
        let records = store.load_all()?;
        if !records.is_empty() {
            debug!(count = records.len(), "loaded address book");
        }
        Ok(Self {
            inner: Arc::new(Inner {
                records: RwLock::new(records),
                store: Box::new(store),
                dirty: Mutex::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Completes when the initial load from persistent storage has
    /// finished. Loading happens in [`open`](Self::open), so this resolves
    /// immediately; callers treating the book as a remote surface await it
    /// before their first read.
    pub async fn loaded(&self) {}

    /// Upsert: merges `data` over any existing record and schedules a
    /// durable write.
    pub fn set(&self, addr: Address, data: PeerRecord) -> Result<(), StoreError> {
        self.check_open()?;
        let mut records = self.inner.records.write();
        match records.get_mut(&addr) {
            Some(existing) => existing.merge(&data),
            None => {
                records.insert(addr, data);
            }
        }
        drop(records);
        self.mark_dirty();
        Ok(())
    }

    /// Remove the entry. Returns whether it existed.
    pub fn delete(&self, addr: &Address) -> Result<bool, StoreError> {
        self.check_open()?;
        let removed = self.inner.records.write().remove(addr).is_some();
        if removed {
            self.mark_dirty();
        }
        Ok(removed)
    }

    pub fn get(&self, addr: &Address) -> Option<PeerRecord> {
        self.inner.records.read().get(addr).cloned()
    }

    pub fn has(&self, addr: &Address) -> bool {
        self.inner.records.read().contains_key(addr)
    }

    pub fn entries(&self) -> Vec<(Address, PeerRecord)> {
        self.inner
            .records
            .read()
            .iter()
            .map(|(a, r)| (a.clone(), r.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.read().is_empty()
    }

    /// First address whose record carries `id`. Used by callers that dial
    /// by identity instead of address.
    pub fn get_address_for_id(&self, id: &FeedId) -> Option<Address> {
        self.inner
            .records
            .read()
            .iter()
            .find(|(_, record)| record.key.as_ref() == Some(id))
            .map(|(addr, _)| addr.clone())
    }

    pub fn is_dirty(&self) -> bool {
        *self.inner.dirty.lock()
    }

    /// Write the image out now if anything changed since the last flush.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut dirty = self.inner.dirty.lock();
        if !*dirty {
            return Ok(());
        }
        let snapshot = self.inner.records.read().clone();
        self.inner.store.save_all(&snapshot)?;
        *dirty = false;
        debug!(count = snapshot.len(), "flushed address book");
        Ok(())
    }

    /// Periodic flush loop; exits once the book is closed. Spawn this next
    /// to the scheduler so mutations become durable within
    /// [`FLUSH_INTERVAL`].
    pub async fn run_flusher(self) {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.inner.closed.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.flush() {
                warn!(error = %e, "address book flush failed");
            }
        }
    }

    /// Final flush; further mutations are rejected with
    /// [`StoreError::Shutdown`].
    pub fn close(&self) -> Result<(), StoreError> {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.flush()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(StoreError::Shutdown);
        }
        Ok(())
    }

    fn mark_dirty(&self) {
        *self.inner.dirty.lock() = true;
    }
}

#[cfg(test)]
mod tests {
    use tangle_peer::Source;

    use super::*;
    use crate::store::{FileStore, MemoryStore};

    fn key(b: u8) -> FeedId {
        FeedId::new([b; 32])
    }

    fn addr(b: u8) -> Address {
        Address::net(format!("host{b}.example.com"), 8008, key(b))
    }

    #[test]
    fn test_set_merges_over_existing() {
        let book = AddressBook::open(MemoryStore::new()).unwrap();
        let a = addr(1);

        book.set(
            a.clone(),
            PeerRecord {
                key: Some(key(1)),
                source: Some(Source::Manual),
                ..Default::default()
            },
        )
        .unwrap();
        book.set(
            a.clone(),
            PeerRecord {
                failure: Some(2),
                ..Default::default()
            },
        )
        .unwrap();

        let record = book.get(&a).unwrap();
        assert_eq!(record.source, Some(Source::Manual));
        assert_eq!(record.failure, Some(2));
    }

    #[test]
    fn test_get_address_for_id() {
        let book = AddressBook::open(MemoryStore::new()).unwrap();
        book.set(addr(1), PeerRecord::with_key(key(1))).unwrap();
        book.set(addr(2), PeerRecord::with_key(key(2))).unwrap();

        assert_eq!(book.get_address_for_id(&key(2)), Some(addr(2)));
        assert_eq!(book.get_address_for_id(&key(9)), None);
    }

    #[test]
    fn test_close_rejects_mutations() {
        let book = AddressBook::open(MemoryStore::new()).unwrap();
        book.close().unwrap();
        assert!(matches!(
            book.set(addr(1), PeerRecord::default()),
            Err(StoreError::Shutdown)
        ));
        assert!(matches!(book.delete(&addr(1)), Err(StoreError::Shutdown)));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conn.json");

        {
            let book = AddressBook::open(FileStore::new(&path).unwrap()).unwrap();
            book.set(addr(1), PeerRecord::with_key(key(1))).unwrap();
            book.delete(&addr(1)).unwrap();
            book.set(addr(2), PeerRecord::with_key(key(2))).unwrap();
            book.close().unwrap();
        }

        let book = AddressBook::open(FileStore::new(&path).unwrap()).unwrap();
        assert!(!book.has(&addr(1)));
        assert!(book.has(&addr(2)));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_flush_clears_dirty() {
        let book = AddressBook::open(MemoryStore::new()).unwrap();
        book.set(addr(1), PeerRecord::with_key(key(1))).unwrap();
        assert!(book.is_dirty());
        book.flush().unwrap();
        assert!(!book.is_dirty());
    }

    #[tokio::test]
    async fn test_flusher_exits_on_close() {
        let book = AddressBook::open(MemoryStore::new()).unwrap();
        let task = tokio::spawn(book.clone().run_flusher());
        book.close().unwrap();
        // First tick fires immediately and observes the closed flag.
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("flusher did not exit")
            .unwrap();
    }
}
