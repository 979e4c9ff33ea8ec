//! Record persistence trait and implementations (memory, file).

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use auto_impl::auto_impl;
use parking_lot::Mutex;
use tangle_peer::{Address, PeerRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("address book is closed")]
    Shutdown,
}

/// Whole-image persistence for the address book.
#[auto_impl(&, Box, Arc)]
pub trait RecordStore: Send + Sync {
    fn load_all(&self) -> Result<HashMap<Address, PeerRecord>, StoreError>;
    fn save_all(&self, records: &HashMap<Address, PeerRecord>) -> Result<(), StoreError>;
}

/// In-memory store for tests and ephemeral setups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Address, PeerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn load_all(&self) -> Result<HashMap<Address, PeerRecord>, StoreError> {
        Ok(self.records.lock().clone())
    }

    fn save_all(&self, records: &HashMap<Address, PeerRecord>) -> Result<(), StoreError> {
        *self.records.lock() = records.clone();
        Ok(())
    }
}

/// JSON file store. Written to a temp file first, then renamed (atomic).
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a store at `path`, making parent directories if needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl RecordStore for FileStore {
    fn load_all(&self) -> Result<HashMap<Address, PeerRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn save_all(&self, records: &HashMap<Address, PeerRecord>) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path)?;
            let writer = BufWriter::new(file);
            serde_json::to_writer_pretty(writer, records)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
