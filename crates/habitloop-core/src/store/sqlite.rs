//! SQLite-backed habit store.
//!
//! Habit documents persist as JSON rows keyed by id, with the uid,
//! creation time, and version mirrored into columns for querying and
//! conditional writes. Snapshots fan out in-process; the version column
//! still guards against writers from other processes.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::config::{self, StoreConfig};
use crate::error::{CoreError, StoreError};
use crate::habit::Habit;
use crate::store::{apply_delta, DocumentStore, FieldDelta, Precondition};
use crate::subscription::{HabitStream, SnapshotHub};

/// Habit store persisted to a local SQLite file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    hub: SnapshotHub,
}

impl SqliteStore {
    /// Open the store at `path`, creating the schema if needed.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(|source| StoreError::OpenFailed {
            path: path.clone(),
            source,
        })?;
        Self::with_connection(conn)
    }

    /// Open the store at `~/.config/habitloop/habitloop.db`.
    pub fn open_default() -> Result<Self, CoreError> {
        let path = config::data_dir()?.join("habitloop.db");
        Ok(Self::open(path)?)
    }

    /// Open the store at the configured path, falling back to the default
    /// location when `sqlite_path` is unset.
    pub fn open_configured(config: &StoreConfig) -> Result<Self, CoreError> {
        match &config.sqlite_path {
            Some(path) => Ok(Self::open(path)?),
            None => Self::open_default(),
        }
    }

    /// Open an in-memory store, for tests and ephemeral runs.
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::OpenFailed {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            hub: SnapshotHub::new(),
        })
    }

    /// Runs under the connection lock, so snapshots leave in commit order.
    fn publish_locked(&self, conn: &Connection, uid: &str) -> Result<(), StoreError> {
        if self.hub.is_watched(uid) {
            self.hub.publish(uid, user_habits(conn, uid)?);
        }
        Ok(())
    }
}

fn user_habits(conn: &Connection, uid: &str) -> Result<Vec<Habit>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, version, doc FROM habits WHERE uid = ?1 ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map(params![uid], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut habits = Vec::new();
    for row in rows {
        let (id, version, doc) = row?;
        habits.push(decode_doc(&id, version, &doc)?);
    }
    Ok(habits)
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS habits (
            id         TEXT PRIMARY KEY,
            uid        TEXT NOT NULL,
            created_at TEXT NOT NULL,
            version    INTEGER NOT NULL DEFAULT 0,
            doc        TEXT NOT NULL
        );

        -- Index for per-user feeds, newest first
        CREATE INDEX IF NOT EXISTS idx_habits_uid_created_at ON habits(uid, created_at);",
    )?;
    Ok(())
}

fn decode_doc(id: &str, version: i64, doc: &str) -> Result<Habit, StoreError> {
    let mut habit: Habit =
        serde_json::from_str(doc).map_err(|err| StoreError::FieldDecode {
            id: id.to_string(),
            message: err.to_string(),
        })?;
    habit.id = id.to_string();
    habit.version = version as u64;
    Ok(habit)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn create(&self, habit: &Habit) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let mut stored = habit.clone();
        stored.id = id.clone();
        stored.version = 0;
        let doc = serde_json::to_string(&stored)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO habits (id, uid, created_at, version, doc)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![id, stored.uid, stored.timestamp.to_rfc3339(), doc],
        )?;
        self.publish_locked(&conn, &stored.uid)?;
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Habit, StoreError> {
        let result = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT version, doc FROM habits WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
        };
        match result {
            Ok((version, doc)) => decode_doc(id, version, &doc),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(StoreError::NotFound { id: id.to_string() })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(
        &self,
        id: &str,
        delta: FieldDelta,
        precondition: Precondition,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT version, doc FROM habits WHERE id = ?1",
            params![id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        );
        let (version, doc) = match result {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StoreError::NotFound { id: id.to_string() })
            }
            Err(err) => return Err(err.into()),
        };
        let current = decode_doc(id, version, &doc)?;

        if let Precondition::Version(expected) = precondition {
            if current.version != expected {
                return Err(StoreError::VersionConflict {
                    id: id.to_string(),
                    expected,
                    actual: current.version,
                });
            }
        }

        let mut updated = apply_delta(&current, &delta)?;
        updated.version = current.version + 1;
        let doc = serde_json::to_string(&updated)?;
        let changed = conn.execute(
            "UPDATE habits SET doc = ?1, version = ?2 WHERE id = ?3 AND version = ?4",
            params![doc, updated.version as i64, id, current.version as i64],
        )?;
        if changed == 0 {
            // The row moved under us: a writer in another process.
            return Err(StoreError::WriteFailed {
                id: id.to_string(),
                message: "row version moved during update".to_string(),
                retryable: true,
            });
        }

        self.publish_locked(&conn, &updated.uid)?;
        Ok(updated.version)
    }

    async fn watch(&self, uid: &str) -> Result<HabitStream, StoreError> {
        // Seed under the lock so no write can slip between the seed and
        // the watcher registration.
        let conn = self.conn.lock().unwrap();
        Ok(self.hub.subscribe(uid, user_habits(&conn, uid)?))
    }
}
