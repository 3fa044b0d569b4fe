use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{LedgerEntry, LedgerKey, LedgerStore};
use crate::error::LedgerError;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    entries: Vec<StoredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    channel_id: String,
    message_id: String,
    mirrored_at: DateTime<Utc>,
}

/// Ledger kept in a single JSON file, rewritten atomically on every append
pub struct JsonLedgerStore {
    path: PathBuf,
    /// Everything on disk, filled by the first load
    cache: Option<Vec<LedgerEntry>>,
}

impl JsonLedgerStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            cache: None,
        }
    }

    fn io_error(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read_file(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            // First run
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let file: LedgerFile =
            serde_json::from_str(&content).map_err(|e| LedgerError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if file.version != FORMAT_VERSION {
            return Err(LedgerError::Corrupt {
                path: self.path.clone(),
                reason: format!("unsupported format version {}", file.version),
            });
        }

        Ok(file
            .entries
            .into_iter()
            .map(|e| LedgerEntry {
                key: LedgerKey::new(e.channel_id, e.message_id),
                mirrored_at: e.mirrored_at,
            })
            .collect())
    }

    fn write_file(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        let file = LedgerFile {
            version: FORMAT_VERSION,
            entries: entries
                .iter()
                .map(|e| StoredEntry {
                    channel_id: e.key.channel_id.clone(),
                    message_id: e.key.message_id.clone(),
                    mirrored_at: e.mirrored_at,
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| LedgerError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        // Write next to the target and rename so a crash never leaves half a file
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }
}

impl LedgerStore for JsonLedgerStore {
    fn load(&mut self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = self.read_file()?;
        self.cache = Some(entries.clone());
        Ok(entries)
    }

    fn append(&mut self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        let mut all = match self.cache.take() {
            Some(cached) => cached,
            None => self.read_file()?,
        };
        let before = all.len();
        for entry in entries {
            if !all.iter().any(|e| e.key == entry.key) {
                all.push(entry.clone());
            }
        }

        let result = if all.len() == before {
            Ok(())
        } else {
            self.write_file(&all)
        };
        // Keep the cache in step with disk even if the write failed
        if result.is_ok() {
            self.cache = Some(all);
        } else {
            all.truncate(before);
            self.cache = Some(all);
        }
        result
    }

    fn reset(&mut self) -> Result<(), LedgerError> {
        self.cache = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(channel: &str, id: &str) -> LedgerEntry {
        LedgerEntry {
            key: LedgerKey::new(channel, id),
            mirrored_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonLedgerStore::new(&dir.path().join("history.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_append_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.json");

        let mut store = JsonLedgerStore::new(&path);
        store.load().unwrap();
        store.append(&[entry("c", "1"), entry("c", "2")]).unwrap();
        store.append(&[entry("c", "2"), entry("d", "1")]).unwrap();

        let mut reopened = JsonLedgerStore::new(&path);
        let keys: Vec<LedgerKey> = reopened.load().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            vec![
                LedgerKey::new("c", "1"),
                LedgerKey::new("c", "2"),
                LedgerKey::new("d", "1"),
            ]
        );
        assert!(!dir.path().join("nested").join("history.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_fails_loud() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut store = JsonLedgerStore::new(&path);
        assert!(matches!(store.load(), Err(LedgerError::Corrupt { .. })));
    }

    #[test]
    fn test_legacy_flat_history_is_rejected() {
        // The old script stored {"<message id>": "<timestamp>"} without channels
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload_history.json");
        std::fs::write(&path, r#"{"42": "2024-01-01T00:00:00"}"#).unwrap();

        let mut store = JsonLedgerStore::new(&path);
        assert!(matches!(store.load(), Err(LedgerError::Corrupt { .. })));
    }

    #[test]
    fn test_reset_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let mut store = JsonLedgerStore::new(&path);
        store.append(&[entry("c", "1")]).unwrap();
        assert!(path.exists());

        store.reset().unwrap();
        assert!(!path.exists());
        assert!(store.load().unwrap().is_empty());
        store.reset().unwrap();
    }
}
