pub mod json;
pub mod sqlite;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::config::LedgerBackend;
use crate::error::LedgerError;

pub use json::JsonLedgerStore;
pub use sqlite::SqliteLedgerStore;

/// Identity of a mirrored message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub channel_id: String,
    pub message_id: String,
}

impl LedgerKey {
    pub fn new(channel_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message_id: message_id.into(),
        }
    }
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub key: LedgerKey,
    pub mirrored_at: DateTime<Utc>,
}

/// Durable storage behind a [`Ledger`]. Stores only ever grow, except for
/// an explicit [`LedgerStore::reset`].
pub trait LedgerStore: Send {
    /// Read every entry. Unreadable storage must be an error, never an empty set.
    fn load(&mut self) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Persist new entries. Keys that already exist are ignored.
    fn append(&mut self, entries: &[LedgerEntry]) -> Result<(), LedgerError>;

    /// Forget everything.
    fn reset(&mut self) -> Result<(), LedgerError>;
}

/// Open the store selected in the config
pub fn open_store(
    backend: LedgerBackend,
    path: &Path,
) -> Result<Box<dyn LedgerStore>, LedgerError> {
    match backend {
        LedgerBackend::Json => Ok(Box::new(JsonLedgerStore::new(path))),
        LedgerBackend::Sqlite => Ok(Box::new(SqliteLedgerStore::open(path)?)),
    }
}

/// In-memory view of the mirrored-message set for one run.
///
/// New keys are written through to the store as they are recorded. Writes
/// that fail stay pending until [`Ledger::flush`], which also runs on drop so
/// progress survives an early exit.
pub struct Ledger {
    store: Box<dyn LedgerStore>,
    keys: HashSet<LedgerKey>,
    pending: Vec<LedgerEntry>,
}

impl Ledger {
    /// Load the full ledger. Fails if the store can't be read.
    pub fn open(mut store: Box<dyn LedgerStore>) -> Result<Self, LedgerError> {
        let entries = store.load()?;
        let keys: HashSet<LedgerKey> = entries.into_iter().map(|e| e.key).collect();
        info!("Ledger loaded with {} entries", keys.len());
        Ok(Self {
            store,
            keys,
            pending: Vec::new(),
        })
    }

    pub fn contains(&self, key: &LedgerKey) -> bool {
        self.keys.contains(key)
    }

    /// Mark a message as mirrored. Returns false if it already was.
    pub fn record(&mut self, key: LedgerKey) -> bool {
        if !self.keys.insert(key.clone()) {
            return false;
        }

        let entry = LedgerEntry {
            key,
            mirrored_at: Utc::now(),
        };
        self.pending.push(entry);
        if let Err(e) = self.write_pending() {
            warn!("Ledger write failed, will retry on flush: {}", e);
        }
        true
    }

    /// Persist anything not yet written.
    pub fn flush(&mut self) -> Result<(), LedgerError> {
        self.write_pending()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn write_pending(&mut self) -> Result<(), LedgerError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.store.append(&self.pending)?;
        debug!("Ledger persisted {} entries", self.pending.len());
        self.pending.clear();
        Ok(())
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        if let Err(e) = self.write_pending() {
            error!(
                "Ledger lost {} entries on close: {}",
                self.pending.len(),
                e
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Store that keeps everything in a shared vec and can be told to fail writes
    #[derive(Clone, Default)]
    pub(crate) struct MemoryLedgerStore {
        pub entries: Arc<Mutex<Vec<LedgerEntry>>>,
        pub fail_writes: Arc<Mutex<bool>>,
    }

    impl LedgerStore for MemoryLedgerStore {
        fn load(&mut self) -> Result<Vec<LedgerEntry>, LedgerError> {
            Ok(self.entries.lock().unwrap().clone())
        }

        fn append(&mut self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
            if *self.fail_writes.lock().unwrap() {
                return Err(LedgerError::Io {
                    path: "memory".into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            let mut stored = self.entries.lock().unwrap();
            for entry in entries {
                if !stored.iter().any(|e| e.key == entry.key) {
                    stored.push(entry.clone());
                }
            }
            Ok(())
        }

        fn reset(&mut self) -> Result<(), LedgerError> {
            self.entries.lock().unwrap().clear();
            Ok(())
        }
    }

    #[test]
    fn test_record_is_idempotent() {
        let store = MemoryLedgerStore::default();
        let mut ledger = Ledger::open(Box::new(store.clone())).unwrap();

        assert!(ledger.record(LedgerKey::new("c", "42")));
        assert!(!ledger.record(LedgerKey::new("c", "42")));
        assert_eq!(ledger.len(), 1);
        assert_eq!(store.entries.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_keys_are_scoped_by_channel() {
        let mut ledger = Ledger::open(Box::new(MemoryLedgerStore::default())).unwrap();
        ledger.record(LedgerKey::new("a", "1"));
        assert!(ledger.contains(&LedgerKey::new("a", "1")));
        assert!(!ledger.contains(&LedgerKey::new("b", "1")));
    }

    #[test]
    fn test_reopen_sees_recorded_keys() {
        let store = MemoryLedgerStore::default();
        {
            let mut ledger = Ledger::open(Box::new(store.clone())).unwrap();
            ledger.record(LedgerKey::new("c", "1"));
            ledger.record(LedgerKey::new("c", "2"));
        }
        let ledger = Ledger::open(Box::new(store)).unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.contains(&LedgerKey::new("c", "2")));
    }

    #[test]
    fn test_failed_write_retried_on_flush() {
        let store = MemoryLedgerStore::default();
        let mut ledger = Ledger::open(Box::new(store.clone())).unwrap();

        *store.fail_writes.lock().unwrap() = true;
        ledger.record(LedgerKey::new("c", "1"));
        assert_eq!(ledger.pending(), 1);
        assert!(ledger.contains(&LedgerKey::new("c", "1")));
        assert!(ledger.flush().is_err());

        *store.fail_writes.lock().unwrap() = false;
        ledger.flush().unwrap();
        assert_eq!(ledger.pending(), 0);
        assert_eq!(store.entries.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_drop_flushes_pending() {
        let store = MemoryLedgerStore::default();
        {
            let mut ledger = Ledger::open(Box::new(store.clone())).unwrap();
            *store.fail_writes.lock().unwrap() = true;
            ledger.record(LedgerKey::new("c", "9"));
            *store.fail_writes.lock().unwrap() = false;
        }
        assert_eq!(store.entries.lock().unwrap().len(), 1);
    }
}
