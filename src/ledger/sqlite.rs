use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

use super::{LedgerEntry, LedgerKey, LedgerStore};
use crate::error::LedgerError;

/// Ledger kept in a SQLite table keyed by (channel_id, message_id)
pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;
        info!("Ledger database initialized at: {}", path.display());
        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    fn run_migrations(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS mirrored_messages (
                channel_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                mirrored_at TEXT NOT NULL,
                PRIMARY KEY (channel_id, message_id)
            );
            ",
        )?;
        Ok(())
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn load(&mut self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT channel_id, message_id, mirrored_at
             FROM mirrored_messages
             ORDER BY mirrored_at ASC",
        )?;

        let entries = stmt
            .query_map([], |row| {
                let mirrored_at: DateTime<Utc> = row.get(2)?;
                Ok(LedgerEntry {
                    key: LedgerKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    mirrored_at,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    fn append(&mut self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO mirrored_messages (channel_id, message_id, mirrored_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            for entry in entries {
                stmt.execute(rusqlite::params![
                    entry.key.channel_id,
                    entry.key.message_id,
                    entry.mirrored_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), LedgerError> {
        self.conn.execute("DELETE FROM mirrored_messages", [])?;
        Ok(())
    }
}
