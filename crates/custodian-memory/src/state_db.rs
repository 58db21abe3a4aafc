//! Durable agent state.
//!
//! Persists the agent's key/value state documents (allow-list, kiosk package,
//! device name, capability grants, geofence containment, last snapshot hash)
//! to a local SQLite database so they survive process and device restarts.
//!
//! # Storage layout
//!
//! A single table `agent_state` is created (if it does not already exist):
//!
//! | column      | type | description                              |
//! |-------------|------|------------------------------------------|
//! | key         | TEXT | Well-known state key, primary key        |
//! | value       | TEXT | JSON document                            |
//! | updated_at  | TEXT | RFC-3339 time of the last write (UTC)    |
//!
//! # Example
//!
//! ```rust
//! use custodian_memory::state_db::StateDb;
//! use custodian_types::{StateStoreExt, store::keys};
//!
//! let db = StateDb::open_in_memory().unwrap();
//! db.save(keys::DEVICE_NAME, "front-desk-tablet").unwrap();
//! let name: Option<String> = db.load(keys::DEVICE_NAME).unwrap();
//! assert_eq!(name.as_deref(), Some("front-desk-tablet"));
//! ```

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use custodian_types::{CustodianError, StateStore};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from state database operations.
#[derive(Error, Debug)]
pub enum StateDbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StateDbError> for CustodianError {
    fn from(e: StateDbError) -> Self {
        CustodianError::Storage(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StateDb
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed [`StateStore`].
pub struct StateDb {
    conn: Mutex<Connection>,
}

impl StateDb {
    /// Open (or create) a persistent database at `path`, creating parent
    /// directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateDbError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "state database opened");
        Self::with_connection(conn)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StateDbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StateDbError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agent_state (
                key        TEXT NOT NULL PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Time of the last write to `key`, if it exists.
    pub fn updated_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, StateDbError> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT updated_at FROM agent_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// All stored keys in lexical order.
    pub fn keys(&self) -> Result<Vec<String>, StateDbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key FROM agent_state ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }
}

impl StateStore for StateDb {
    fn load_raw(&self, key: &str) -> Result<Option<String>, CustodianError> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM agent_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(StateDbError::from)?;
        Ok(value)
    }

    fn save_raw(&self, key: &str, value: &str) -> Result<(), CustodianError> {
        self.conn()
            .execute(
                "INSERT INTO agent_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .map_err(StateDbError::from)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CustodianError> {
        self.conn()
            .execute("DELETE FROM agent_state WHERE key = ?1", params![key])
            .map_err(StateDbError::from)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
