//! Per-user habit snapshot streams.
//!
//! `DocumentStore::watch` hands back a `HabitStream`: a lazy sequence of
//! full snapshots of one user's habit collection. The first snapshot
//! arrives without waiting for a change; later ones follow each mutation
//! of that user's documents. Dropping the stream ends the subscription --
//! the backend notices the closed channel on its next publish and
//! unregisters the watcher.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::habit::{self, Habit};

/// One full view of a user's habits at a point in time.
#[derive(Debug, Clone)]
pub struct HabitSnapshot {
    /// Matching habits, newest-created first
    pub habits: Vec<Habit>,
    /// When the backend took the snapshot
    pub at: DateTime<Utc>,
}

/// A live subscription to one user's habit collection.
pub struct HabitStream {
    receiver: mpsc::UnboundedReceiver<HabitSnapshot>,
}

impl HabitStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<HabitSnapshot>) -> Self {
        Self { receiver }
    }

    /// Next snapshot, or `None` once the backend has gone away.
    pub async fn next(&mut self) -> Option<HabitSnapshot> {
        self.receiver.recv().await
    }

    /// Adapt into a `Stream` for combinator-style consumers.
    pub fn into_stream(self) -> UnboundedReceiverStream<HabitSnapshot> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

/// Snapshot fan-out shared by the in-process backends.
///
/// Watchers are registered per uid; publishing to a uid clones the
/// snapshot to every live watcher of that uid and drops the dead ones.
pub(crate) struct SnapshotHub {
    watchers: Mutex<Vec<Watcher>>,
}

struct Watcher {
    uid: String,
    sender: mpsc::UnboundedSender<HabitSnapshot>,
}

impl SnapshotHub {
    pub(crate) fn new() -> Self {
        Self {
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Register a watcher for `uid`, seeded with `initial` ahead of any
    /// later publishes. Only the new watcher sees the seed snapshot.
    pub(crate) fn subscribe(&self, uid: &str, mut initial: Vec<Habit>) -> HabitStream {
        habit::sort_newest_first(&mut initial);
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(HabitSnapshot {
            habits: initial,
            at: Utc::now(),
        });
        self.watchers.lock().unwrap().push(Watcher {
            uid: uid.to_string(),
            sender,
        });
        HabitStream::new(receiver)
    }

    /// Whether anyone is currently watching `uid`.
    pub(crate) fn is_watched(&self, uid: &str) -> bool {
        self.watchers
            .lock()
            .unwrap()
            .iter()
            .any(|watcher| watcher.uid == uid)
    }

    /// Send a fresh snapshot to every watcher of `uid`.
    pub(crate) fn publish(&self, uid: &str, mut habits: Vec<Habit>) {
        habit::sort_newest_first(&mut habits);
        let snapshot = HabitSnapshot {
            habits,
            at: Utc::now(),
        };
        // retain doubles as cleanup: a send on a dropped stream fails and
        // the watcher is unregistered.
        self.watchers.lock().unwrap().retain(|watcher| {
            watcher.uid != uid || watcher.sender.send(snapshot.clone()).is_ok()
        });
    }
}
