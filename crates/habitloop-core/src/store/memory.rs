//! In-memory habit store.
//!
//! Backs tests and previews with the same contract as the durable
//! backends: assigned ids, version bumps on every write, and per-user
//! watch streams.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::habit::Habit;
use crate::store::{apply_delta, DocumentStore, FieldDelta, Precondition};
use crate::subscription::{HabitStream, SnapshotHub};

/// Habit store living entirely in process memory.
pub struct MemoryStore {
    docs: Mutex<HashMap<String, Habit>>,
    hub: SnapshotHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            hub: SnapshotHub::new(),
        }
    }

    /// Number of stored documents, across all users.
    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs under the document lock, so snapshots leave in commit order.
    fn publish_locked(&self, docs: &HashMap<String, Habit>, uid: &str) {
        if self.hub.is_watched(uid) {
            self.hub.publish(uid, user_habits(docs, uid));
        }
    }
}

fn user_habits(docs: &HashMap<String, Habit>, uid: &str) -> Vec<Habit> {
    docs.values()
        .filter(|habit| habit.uid == uid)
        .cloned()
        .collect()
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, habit: &Habit) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let mut stored = habit.clone();
        stored.id = id.clone();
        stored.version = 0;
        let uid = stored.uid.clone();

        let mut docs = self.docs.lock().unwrap();
        docs.insert(id.clone(), stored);
        self.publish_locked(&docs, &uid);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Habit, StoreError> {
        self.docs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn update(
        &self,
        id: &str,
        delta: FieldDelta,
        precondition: Precondition,
    ) -> Result<u64, StoreError> {
        let mut docs = self.docs.lock().unwrap();
        let current = docs
            .get(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        if let Precondition::Version(expected) = precondition {
            if current.version != expected {
                return Err(StoreError::VersionConflict {
                    id: id.to_string(),
                    expected,
                    actual: current.version,
                });
            }
        }

        let mut updated = apply_delta(current, &delta)?;
        updated.version = current.version + 1;
        let uid = updated.uid.clone();
        let new_version = updated.version;
        docs.insert(id.to_string(), updated);

        self.publish_locked(&docs, &uid);
        Ok(new_version)
    }

    async fn watch(&self, uid: &str) -> Result<HabitStream, StoreError> {
        // Seed under the lock so no write can slip between the seed and
        // the watcher registration.
        let docs = self.docs.lock().unwrap();
        Ok(self.hub.subscribe(uid, user_habits(&docs, uid)))
    }
}
