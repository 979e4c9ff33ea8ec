//! Durable address book: `Address -> PeerRecord` with delayed-write persistence.

mod book;
mod store;

pub use book::{AddressBook, FLUSH_INTERVAL};
pub use store::{FileStore, MemoryStore, RecordStore, StoreError};
