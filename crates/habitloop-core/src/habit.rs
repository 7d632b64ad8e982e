//! Habit data model.
//!
//! A habit is stored as one document per habit in a `habits` collection.
//! Serialized field names follow the wire format of the hosted store,
//! which is shared with older mobile clients.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::week::{self, DAYS_PER_WEEK};

/// Completion flags for the current 7-day window.
///
/// Slot 0 is the first day of the window. The whole window resets to
/// all-false at the weekly rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeekProgress([bool; DAYS_PER_WEEK]);

impl WeekProgress {
    /// Fresh window with no completions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Completion flag for one day, `None` outside the window.
    pub fn day(&self, index: usize) -> Option<bool> {
        self.0.get(index).copied()
    }

    /// Set one day's flag. Slots outside the window are ignored.
    pub fn set(&mut self, index: usize, done: bool) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = done;
        }
    }

    /// Number of days marked complete this week.
    pub fn completed_days(&self) -> usize {
        self.0.iter().filter(|done| **done).count()
    }

    /// Whether no day is marked complete.
    pub fn is_clear(&self) -> bool {
        self.0.iter().all(|done| !done)
    }

    /// All seven flags in day order.
    pub fn days(&self) -> &[bool; DAYS_PER_WEEK] {
        &self.0
    }
}

impl From<[bool; DAYS_PER_WEEK]> for WeekProgress {
    fn from(days: [bool; DAYS_PER_WEEK]) -> Self {
        Self(days)
    }
}

/// A tracked habit document.
///
/// `next_reset` keeps its historical wire name `nextSundayDate`; the reset
/// weekday has been configurable since the rollover moved server-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Habit {
    /// Document id assigned by the store
    #[serde(skip)]
    pub id: String,
    /// Owner's user id
    pub uid: String,
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Target completions per week (0..=7)
    pub frequency: u8,
    /// Daily reminder time
    pub alarm: NaiveTime,
    /// Whether the habit is hidden from other users
    pub privacy: bool,
    /// Consecutive completion count, carried across weeks
    pub streak: u32,
    /// Completion flags for the current week window
    pub progress: WeekProgress,
    /// Creation time; feeds sort newest-first on this
    pub timestamp: DateTime<Utc>,
    /// Next scheduled weekly reset
    #[serde(rename = "nextSundayDate")]
    pub next_reset: DateTime<Utc>,
    /// Time of the last progress write
    pub last_update: DateTime<Utc>,
    /// Missable days left before the streak breaks
    pub skip_days: u8,
    /// Write counter for conditional updates
    #[serde(default)]
    pub version: u64,
}

impl Habit {
    /// Whether this week's completions already meet the weekly target.
    pub fn target_met(&self) -> bool {
        self.progress.completed_days() >= self.frequency as usize
    }

    /// Whether the week window has expired and a rollover is owed.
    pub fn due_for_rollover(&self, now: DateTime<Utc>) -> bool {
        now > self.next_reset
    }

    /// Whole days since the last progress write.
    pub fn days_idle(&self, now: DateTime<Utc>) -> i64 {
        week::whole_days_between(self.last_update, now)
    }

    /// Whole days until the scheduled weekly reset, 0 once it is due.
    pub fn days_until_reset(&self, now: DateTime<Utc>) -> i64 {
        week::whole_days_between(now, self.next_reset).max(0)
    }
}

/// Parameters for creating a habit.
///
/// Callers may seed `streak` and `progress` when importing an existing
/// habit; new habits start both at zero. The remaining derived fields
/// (skip days, reset schedule, timestamps) are filled in at creation
/// time and never supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewHabit {
    /// Owner's user id
    pub uid: String,
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Target completions per week (0..=7)
    pub frequency: u8,
    /// Daily reminder time
    pub alarm: NaiveTime,
    /// Whether the habit is hidden from other users
    pub privacy: bool,
    /// Starting streak, 0 unless importing
    #[serde(default)]
    pub streak: u32,
    /// Starting week window, all-false unless importing
    #[serde(default)]
    pub progress: WeekProgress,
}

impl NewHabit {
    /// Check the caller-supplied fields before anything hits a store.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.frequency as usize > DAYS_PER_WEEK {
            return Err(ValidationError::FrequencyOutOfRange {
                frequency: self.frequency,
            });
        }
        Ok(())
    }

    /// Build the full document for a habit created at `now`.
    ///
    /// Skip days start as the complement of the weekly target: a habit due
    /// 5 times a week can be ignored for 2 days without losing its streak.
    pub fn into_habit(self, now: DateTime<Utc>, reset_day: Weekday) -> Habit {
        Habit {
            id: String::new(),
            uid: self.uid,
            name: self.name,
            description: self.description,
            frequency: self.frequency,
            alarm: self.alarm,
            privacy: self.privacy,
            streak: self.streak,
            progress: self.progress,
            timestamp: now,
            next_reset: week::next_reset_after(now, reset_day),
            last_update: now,
            skip_days: (DAYS_PER_WEEK as u8).saturating_sub(self.frequency),
            version: 0,
        }
    }
}

/// Order habits the way feeds expect them: newest creation first.
pub fn sort_newest_first(habits: &mut [Habit]) {
    habits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}
