//! Record store - per-entity persistence.
//!
//! Every persisted entity (client key record, known server, admin credential,
//! server identity) is stored as one independently addressable record keyed
//! by `(kind, id)`. Bodies are JSON documents. A record that fails to decode
//! is reported and skipped; it never prevents the remaining records of the
//! same kind from loading.
//!
//! Two backends are provided:
//! - [`SqliteRecordStore`]: durable SQLite database in WAL mode
//! - [`MemoryRecordStore`]: process-local map, used by tests and ephemeral nodes

use crate::error::{CoreError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use tracing::warn;

/// Kind of persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Per-client key record
    Client,
    /// Known peer server
    Server,
    /// Superseded server id pointing at its replacement
    ServerAlias,
    /// Singleton administrative credential
    AdminCredential,
    /// Singleton identity keypair of this server
    ServerIdentity,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Client => "client",
            RecordKind::Server => "server",
            RecordKind::ServerAlias => "server_alias",
            RecordKind::AdminCredential => "admin_credential",
            RecordKind::ServerIdentity => "server_identity",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw record as held by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: String,
    pub body: String,
}

/// Storage backend for independently addressable records.
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record.
    fn put(&self, kind: RecordKind, id: &str, body: &str) -> Result<()>;

    /// Fetch a single record body.
    fn get(&self, kind: RecordKind, id: &str) -> Result<Option<String>>;

    /// Delete a record. Returns whether it existed.
    fn remove(&self, kind: RecordKind, id: &str) -> Result<bool>;

    /// List every record of a kind.
    fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>>;
}

/// Records of one kind decoded from a store.
#[derive(Debug)]
pub struct Loaded<T> {
    pub records: Vec<T>,
    /// Ids of records that could not be decoded
    pub corrupt: Vec<String>,
}

/// Typed JSON helpers over any [`RecordStore`].
pub trait RecordStoreExt: RecordStore {
    fn put_json<T: Serialize>(&self, kind: RecordKind, id: &str, value: &T) -> Result<()> {
        let body = serde_json::to_string(value)?;
        self.put(kind, id, &body)
    }

    fn get_json<T: DeserializeOwned>(&self, kind: RecordKind, id: &str) -> Result<Option<T>> {
        match self.get(kind, id)? {
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| CoreError::CorruptRecord {
                    kind: kind.to_string(),
                    id: id.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Decode every record of `kind`, skipping the ones that fail.
    fn load_all_json<T: DeserializeOwned>(&self, kind: RecordKind) -> Result<Loaded<T>> {
        let mut loaded = Loaded {
            records: Vec::new(),
            corrupt: Vec::new(),
        };
        for record in self.list(kind)? {
            match serde_json::from_str::<T>(&record.body) {
                Ok(value) => loaded.records.push(value),
                Err(e) => {
                    warn!(
                        kind = %kind,
                        id = %record.id,
                        error = %e,
                        "Skipping corrupt record"
                    );
                    loaded.corrupt.push(record.id);
                }
            }
        }
        Ok(loaded)
    }
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<(RecordKind, String), String>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records of a kind.
    pub fn count(&self, kind: RecordKind) -> usize {
        self.records
            .read()
            .map(|records| records.keys().filter(|(k, _)| *k == kind).count())
            .unwrap_or(0)
    }
}

fn poisoned<E>(_: E) -> CoreError {
    CoreError::LockPoisoned("record store".to_string())
}

impl RecordStore for MemoryRecordStore {
    fn put(&self, kind: RecordKind, id: &str, body: &str) -> Result<()> {
        self.records
            .write()
            .map_err(poisoned)?
            .insert((kind, id.to_string()), body.to_string());
        Ok(())
    }

    fn get(&self, kind: RecordKind, id: &str) -> Result<Option<String>> {
        Ok(self
            .records
            .read()
            .map_err(poisoned)?
            .get(&(kind, id.to_string()))
            .cloned())
    }

    fn remove(&self, kind: RecordKind, id: &str) -> Result<bool> {
        Ok(self
            .records
            .write()
            .map_err(poisoned)?
            .remove(&(kind, id.to_string()))
            .is_some())
    }

    fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut out: Vec<StoredRecord> = records
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, id), body)| StoredRecord {
                id: id.clone(),
                body: body.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRecordStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::{poisoned, RecordKind, RecordStore, StoredRecord};
    use crate::error::Result;
    use crate::time::current_timestamp_ms;
    use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
    use std::path::Path;
    use std::sync::Mutex;
    use tracing::info;

    /// SQLite-backed record store.
    ///
    /// One row per record; rows are written individually so a damaged body
    /// only affects its own entity.
    pub struct SqliteRecordStore {
        conn: Mutex<Connection>,
    }

    impl SqliteRecordStore {
        /// Create or open a store at the specified path
        pub fn open(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();

            info!(path = %path.display(), "Opening record store");

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;

            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            Self::init_schema(&conn)?;

            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        /// Open a private in-memory database.
        pub fn open_in_memory() -> Result<Self> {
            let conn = Connection::open_in_memory()?;
            Self::init_schema(&conn)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn init_schema(conn: &Connection) -> Result<()> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS records (
                    kind TEXT NOT NULL,
                    id TEXT NOT NULL,
                    body TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (kind, id)
                );
                "#,
            )?;
            Ok(())
        }
    }

    impl RecordStore for SqliteRecordStore {
        fn put(&self, kind: RecordKind, id: &str, body: &str) -> Result<()> {
            let conn = self.conn.lock().map_err(poisoned)?;
            conn.execute(
                "INSERT INTO records (kind, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(kind, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![kind.as_str(), id, body, current_timestamp_ms() as i64],
            )?;
            Ok(())
        }

        fn get(&self, kind: RecordKind, id: &str) -> Result<Option<String>> {
            let conn = self.conn.lock().map_err(poisoned)?;
            let body = conn
                .query_row(
                    "SELECT body FROM records WHERE kind = ?1 AND id = ?2",
                    params![kind.as_str(), id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(body)
        }

        fn remove(&self, kind: RecordKind, id: &str) -> Result<bool> {
            let conn = self.conn.lock().map_err(poisoned)?;
            let changed = conn.execute(
                "DELETE FROM records WHERE kind = ?1 AND id = ?2",
                params![kind.as_str(), id],
            )?;
            Ok(changed > 0)
        }

        fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>> {
            let conn = self.conn.lock().map_err(poisoned)?;
            let mut stmt =
                conn.prepare("SELECT id, body FROM records WHERE kind = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![kind.as_str()], |row| {
                Ok(StoredRecord {
                    id: row.get(0)?,
                    body: row.get(1)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        }
    }
}
