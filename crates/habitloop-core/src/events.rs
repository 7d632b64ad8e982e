use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the broadcast channel.
/// Slow consumers lag and skip old events rather than blocking writers.
const BUS_CAPACITY: usize = 256;

/// Every rule decision the tracker makes produces an event.
/// UIs poll or subscribe for them; nothing in the engine depends on a
/// subscriber being present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TrackerEvent {
    /// A habit document was created.
    HabitCreated {
        habit_id: String,
        uid: String,
        at: DateTime<Utc>,
    },
    /// A day was marked in the week window and the write stuck.
    ProgressUpdated {
        habit_id: String,
        day_index: usize,
        completed: bool,
        streak: u32,
        skip_days: u8,
        at: DateTime<Utc>,
    },
    /// The idle gap exceeded the skip-day allowance; streak went to zero.
    StreakBroken {
        habit_id: String,
        days_idle: i64,
        at: DateTime<Utc>,
    },
    /// A weekly rollover completed: window cleared, next reset scheduled.
    WeekRolledOver {
        habit_id: String,
        next_reset: DateTime<Utc>,
        at: DateTime<Utc>,
    },
}

/// Shared broadcast bus for tracker events.
///
/// Clone cheaply -- the underlying `broadcast::Sender` is Arc-backed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TrackerEvent>,
}

impl EventBus {
    /// Create a new bus with the standard capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribe to events emitted after this call. No replay.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: TrackerEvent) {
        // send() errors only when there are 0 subscribers; that's fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
