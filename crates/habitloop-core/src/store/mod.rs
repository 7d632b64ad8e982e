//! Habit document stores.
//!
//! Three backends share one async contract:
//! - `MemoryStore` keeps everything in process, for tests and previews
//! - `SqliteStore` persists locally through rusqlite
//! - `RestStore` talks to the hosted document API over HTTPS
//!
//! `AnyStore` opens whichever of the three the configuration names.
//!
//! Every store keys habits by an opaque document id, applies partial
//! updates with an optional version guard, and serves per-user snapshot
//! streams ordered newest-first. The local backends publish and seed
//! snapshots while still holding their document lock, so watchers see
//! writes in commit order.

mod memory;
mod rest;
mod sqlite;

pub use memory::MemoryStore;
pub use rest::{RestStore, RestStoreConfig};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{CoreError, StoreError};
use crate::habit::{Habit, WeekProgress};
use crate::subscription::HabitStream;

/// Collection habits live in, shared by every backend.
pub const HABITS_COLLECTION: &str = "habits";

/// Guard for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precondition {
    /// Last write wins, matching the behavior of legacy mobile clients.
    #[default]
    None,
    /// Apply only while the stored version still matches; a stale guard
    /// gets `StoreError::VersionConflict` back.
    Version(u64),
}

/// A partial update touching only the named fields.
///
/// Keys use wire names so the same payload works against every backend,
/// including the hosted API.
#[derive(Debug, Clone, Default)]
pub struct FieldDelta {
    fields: Map<String, Value>,
}

impl FieldDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole week window.
    pub fn progress(mut self, progress: WeekProgress) -> Self {
        let days = progress.days().iter().map(|done| Value::Bool(*done)).collect();
        self.fields.insert("progress".to_string(), Value::Array(days));
        self
    }

    /// Set the streak counter.
    pub fn streak(mut self, streak: u32) -> Self {
        self.fields.insert("streak".to_string(), Value::from(streak));
        self
    }

    /// Set the remaining skip-day allowance.
    pub fn skip_days(mut self, skip_days: u8) -> Self {
        self.fields.insert("skipDays".to_string(), Value::from(skip_days));
        self
    }

    /// Stamp the last progress write.
    pub fn last_update(mut self, at: DateTime<Utc>) -> Self {
        self.fields
            .insert("lastUpdate".to_string(), Value::String(at.to_rfc3339()));
        self
    }

    /// Schedule the next weekly reset.
    pub fn next_reset(mut self, at: DateTime<Utc>) -> Self {
        self.fields
            .insert("nextSundayDate".to_string(), Value::String(at.to_rfc3339()));
        self
    }

    /// Whether the delta names no fields at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The named fields, keyed by wire name.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consume the delta into its field map.
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

/// Every habit backend implements this contract.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a new document and return its assigned id.
    ///
    /// The id and version carried on `habit` are ignored; the store
    /// assigns both.
    async fn create(&self, habit: &Habit) -> Result<String, StoreError>;

    /// Fetch one document by id.
    async fn get(&self, id: &str) -> Result<Habit, StoreError>;

    /// Apply a partial update and return the document's new version.
    async fn update(
        &self,
        id: &str,
        delta: FieldDelta,
        precondition: Precondition,
    ) -> Result<u64, StoreError>;

    /// Stream snapshots of one user's habits, newest first.
    ///
    /// The first snapshot arrives without waiting for a change. Dropping
    /// the stream ends the subscription.
    async fn watch(&self, uid: &str) -> Result<HabitStream, StoreError>;
}

/// A store opened from configuration.
///
/// Wraps the concrete backends behind one type, so an embedder can hold
/// a single tracker over whatever backend the config names.
pub enum AnyStore {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
    Rest(RestStore),
}

impl AnyStore {
    /// Open the backend named by `config.backend`.
    ///
    /// # Errors
    /// Returns an error if the SQLite file cannot be opened or the REST
    /// base URL does not parse.
    pub fn open(config: &StoreConfig) -> Result<Self, CoreError> {
        match config.backend {
            StoreBackend::Memory => Ok(Self::Memory(MemoryStore::new())),
            StoreBackend::Sqlite => Ok(Self::Sqlite(SqliteStore::open_configured(config)?)),
            StoreBackend::Rest => Ok(Self::Rest(RestStore::new(RestStoreConfig::from(config))?)),
        }
    }
}

#[async_trait]
impl DocumentStore for AnyStore {
    async fn create(&self, habit: &Habit) -> Result<String, StoreError> {
        match self {
            Self::Memory(store) => store.create(habit).await,
            Self::Sqlite(store) => store.create(habit).await,
            Self::Rest(store) => store.create(habit).await,
        }
    }

    async fn get(&self, id: &str) -> Result<Habit, StoreError> {
        match self {
            Self::Memory(store) => store.get(id).await,
            Self::Sqlite(store) => store.get(id).await,
            Self::Rest(store) => store.get(id).await,
        }
    }

    async fn update(
        &self,
        id: &str,
        delta: FieldDelta,
        precondition: Precondition,
    ) -> Result<u64, StoreError> {
        match self {
            Self::Memory(store) => store.update(id, delta, precondition).await,
            Self::Sqlite(store) => store.update(id, delta, precondition).await,
            Self::Rest(store) => store.update(id, delta, precondition).await,
        }
    }

    async fn watch(&self, uid: &str) -> Result<HabitStream, StoreError> {
        match self {
            Self::Memory(store) => store.watch(uid).await,
            Self::Sqlite(store) => store.watch(uid).await,
            Self::Rest(store) => store.watch(uid).await,
        }
    }
}

/// Merge a delta into a stored document.
///
/// The result keeps the input's id and version; callers bump the version
/// after a successful write. A delta value with the wrong type surfaces
/// as `FieldDecode`, before anything is persisted.
pub(crate) fn apply_delta(habit: &Habit, delta: &FieldDelta) -> Result<Habit, StoreError> {
    let mut value = serde_json::to_value(habit)?;
    let object = value.as_object_mut().ok_or_else(|| StoreError::FieldDecode {
        id: habit.id.clone(),
        message: "document is not a JSON object".to_string(),
    })?;
    for (name, field) in delta.fields() {
        object.insert(name.clone(), field.clone());
    }

    let mut updated: Habit =
        serde_json::from_value(value).map_err(|err| StoreError::FieldDecode {
            id: habit.id.clone(),
            message: err.to_string(),
        })?;
    updated.id = habit.id.clone();
    updated.version = habit.version;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::habit::NewHabit;
    use chrono::{NaiveTime, TimeZone, Weekday};

    fn sample_habit() -> Habit {
        let now = Utc.with_ymd_and_hms(2023, 4, 5, 9, 0, 0).unwrap();
        let mut habit = NewHabit {
            uid: "user-1".to_string(),
            name: "Stretch".to_string(),
            description: String::new(),
            frequency: 3,
            alarm: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            privacy: false,
            ..NewHabit::default()
        }
        .into_habit(now, Weekday::Sun);
        habit.id = "habit-1".to_string();
        habit
    }

    #[test]
    fn test_delta_uses_wire_names() {
        let delta = FieldDelta::new().streak(4).skip_days(2);
        let fields = delta.fields();
        assert!(fields.contains_key("streak"));
        assert!(fields.contains_key("skipDays"));
        assert!(!fields.contains_key("skip_days"));
    }

    #[test]
    fn test_apply_delta_touches_only_named_fields() {
        let habit = sample_habit();
        let mut progress = WeekProgress::new();
        progress.set(2, true);

        let delta = FieldDelta::new().progress(progress).streak(1);
        let updated = apply_delta(&habit, &delta).unwrap();

        assert_eq!(updated.streak, 1);
        assert_eq!(updated.progress.day(2), Some(true));
        // Untouched fields survive, including the version.
        assert_eq!(updated.name, habit.name);
        assert_eq!(updated.skip_days, habit.skip_days);
        assert_eq!(updated.version, habit.version);
        assert_eq!(updated.id, habit.id);
    }

    #[test]
    fn test_apply_delta_rejects_wrong_type() {
        let habit = sample_habit();
        let mut delta = FieldDelta::new();
        delta
            .fields
            .insert("streak".to_string(), Value::String("four".to_string()));

        let err = apply_delta(&habit, &delta).unwrap_err();
        assert!(matches!(err, StoreError::FieldDecode { .. }));
    }

    #[test]
    fn test_precondition_defaults_to_none() {
        assert_eq!(Precondition::default(), Precondition::None);
    }

    #[tokio::test]
    async fn test_any_store_opens_the_configured_sqlite_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            backend: StoreBackend::Sqlite,
            sqlite_path: Some(dir.path().join("habits.db")),
            ..StoreConfig::default()
        };

        let store = AnyStore::open(&config).unwrap();
        assert!(matches!(store, AnyStore::Sqlite(_)));

        // The contract forwards through the wrapper.
        let id = store.create(&sample_habit()).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().version, 0);
    }

    #[test]
    fn test_any_store_opens_the_memory_backend() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            ..StoreConfig::default()
        };
        assert!(matches!(
            AnyStore::open(&config),
            Ok(AnyStore::Memory(_))
        ));
    }

    #[test]
    fn test_any_store_rest_backend_fails_fast_without_a_base_url() {
        let config = StoreConfig {
            backend: StoreBackend::Rest,
            ..StoreConfig::default()
        };
        assert!(AnyStore::open(&config).is_err());
    }
}
