//! Habit progress and weekly rollover engine.
//!
//! The tracker owns every rule decision:
//! - crediting or breaking streaks when a day is marked
//! - spending the skip-day allowance across idle gaps
//! - rolling expired week windows into fresh ones
//!
//! Rule decisions are pure functions over a habit document and an
//! explicit `now`; the tracker wires them to a `DocumentStore` with
//! version-guarded writes and a bounded retry budget.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::config::TrackerConfig;
use crate::error::{CoreError, Result, StoreError, ValidationError};
use crate::events::{EventBus, TrackerEvent};
use crate::habit::{Habit, NewHabit, WeekProgress};
use crate::store::{DocumentStore, FieldDelta, Precondition};
use crate::subscription::HabitStream;
use crate::week::{self, DAYS_PER_WEEK};

/// What marking a day did to the habit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    /// First touch of an untouched slot inside the allowance: the streak
    /// grew and the idle gap was spent from the skip days.
    Credited,
    /// The slot had already been touched this week: only the flag moved.
    AlreadyCredited,
    /// The idle gap exceeded the allowance: the streak reset to zero.
    StreakReset,
}

/// New field values for a progress update, before any write.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressChange {
    pub kind: ProgressKind,
    pub progress: WeekProgress,
    pub streak: u32,
    pub skip_days: u8,
    /// Whole days between the habit's last write and `now`, floored at 0
    pub days_idle: i64,
}

/// Decide how marking `day_index` at `now` changes a habit.
///
/// The streak rules, in order:
/// - An idle gap longer than the remaining skip days resets the streak.
///   The allowance itself is left as it stands until the next rollover.
/// - Otherwise the first touch of an untouched slot spends the idle gap
///   from the allowance and credits the streak, whichever flag is being
///   written.
/// - Touching an already-marked slot only rewrites the flag.
///
/// The day's flag is always set to `completed`, whatever branch ran.
pub fn decide_progress(
    habit: &Habit,
    day_index: usize,
    completed: bool,
    now: DateTime<Utc>,
) -> Result<ProgressChange, ValidationError> {
    let prior = habit
        .progress
        .day(day_index)
        .ok_or(ValidationError::DayIndexOutOfRange { index: day_index })?;

    // A rewound clock counts as no elapsed days.
    let days_idle = habit.days_idle(now).max(0);

    let mut streak = habit.streak;
    let mut skip_days = habit.skip_days;
    let kind = if days_idle > i64::from(skip_days) {
        streak = 0;
        ProgressKind::StreakReset
    } else if !prior {
        skip_days = (i64::from(skip_days) - days_idle).max(0) as u8;
        streak += 1;
        ProgressKind::Credited
    } else {
        ProgressKind::AlreadyCredited
    };

    let mut progress = habit.progress;
    progress.set(day_index, completed);

    Ok(ProgressChange {
        kind,
        progress,
        streak,
        skip_days,
        days_idle,
    })
}

/// Outcome of one progress update, after the write stuck.
#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub habit_id: String,
    pub day_index: usize,
    pub completed: bool,
    pub kind: ProgressKind,
    pub streak: u32,
    pub skip_days: u8,
    pub days_idle: i64,
    /// Document version after the write
    pub version: u64,
}

/// Summary of one rollover sweep.
#[derive(Debug, Default)]
pub struct RolloverReport {
    /// Habits inspected
    pub checked: usize,
    /// Habits rolled into a fresh week
    pub rolled_over: usize,
    /// Habits whose rollover failed, with the error
    pub failed: Vec<(String, CoreError)>,
}

/// Habit engine over a document store.
///
/// Progress updates read a document, decide new field values, and write
/// them guarded by the version they read. A lost race re-reads and
/// re-decides; transient write failures back off and retry, up to the
/// configured attempt budget.
pub struct HabitTracker<S> {
    store: Arc<S>,
    config: TrackerConfig,
    events: EventBus,
}

impl<S> Clone for HabitTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: DocumentStore + 'static> HabitTracker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, TrackerConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: TrackerConfig) -> Self {
        Self {
            store,
            config,
            events: EventBus::new(),
        }
    }

    /// Subscribe to rule decisions as they land.
    pub fn subscribe_events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// The store this tracker writes through.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create a habit from caller-supplied fields.
    ///
    /// Validates first; derived fields are computed at the current
    /// instant, so a brand-new habit always has a future reset date.
    pub async fn create_habit(&self, new_habit: NewHabit) -> Result<Habit> {
        new_habit.validate()?;
        let now = Utc::now();
        let mut habit = new_habit.into_habit(now, self.config.reset_day);
        let id = self.store.create(&habit).await?;
        habit.id = id.clone();

        tracing::info!("created habit '{}' for uid '{}'", habit.name, habit.uid);
        self.events.emit(TrackerEvent::HabitCreated {
            habit_id: id,
            uid: habit.uid.clone(),
            at: now,
        });
        Ok(habit)
    }

    /// Mark one day of a habit's week window.
    pub async fn update_progress(
        &self,
        habit_id: &str,
        day_index: usize,
        completed: bool,
    ) -> Result<ProgressOutcome> {
        if day_index >= DAYS_PER_WEEK {
            return Err(ValidationError::DayIndexOutOfRange { index: day_index }.into());
        }

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let habit = self.store.get(habit_id).await?;
            let now = Utc::now();
            let change = decide_progress(&habit, day_index, completed, now)?;

            let delta = FieldDelta::new()
                .progress(change.progress)
                .streak(change.streak)
                .skip_days(change.skip_days)
                .last_update(now);

            match self
                .store
                .update(habit_id, delta, Precondition::Version(habit.version))
                .await
            {
                Ok(version) => {
                    self.emit_progress(habit_id, day_index, completed, &change, now);
                    return Ok(ProgressOutcome {
                        habit_id: habit_id.to_string(),
                        day_index,
                        completed,
                        kind: change.kind,
                        streak: change.streak,
                        skip_days: change.skip_days,
                        days_idle: change.days_idle,
                        version,
                    });
                }
                Err(StoreError::VersionConflict { .. }) if attempt < max_attempts => {
                    // Someone else won the write; re-read and re-decide.
                    tracing::debug!("version race on '{habit_id}', attempt {attempt}");
                    continue;
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.retry.backoff_delay(attempt);
                    tracing::warn!(
                        "write to '{habit_id}' failed ({err}), retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(err)
                    if err.is_retryable()
                        || matches!(err, StoreError::VersionConflict { .. }) =>
                {
                    return Err(CoreError::RetriesExhausted {
                        habit_id: habit_id.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn emit_progress(
        &self,
        habit_id: &str,
        day_index: usize,
        completed: bool,
        change: &ProgressChange,
        now: DateTime<Utc>,
    ) {
        if change.kind == ProgressKind::StreakReset {
            tracing::info!(
                "streak broken for '{habit_id}' after {} idle days",
                change.days_idle
            );
            self.events.emit(TrackerEvent::StreakBroken {
                habit_id: habit_id.to_string(),
                days_idle: change.days_idle,
                at: now,
            });
        }
        self.events.emit(TrackerEvent::ProgressUpdated {
            habit_id: habit_id.to_string(),
            day_index,
            completed,
            streak: change.streak,
            skip_days: change.skip_days,
            at: now,
        });
    }

    /// Clear the week window to all-false.
    pub async fn reset_progress(&self, habit_id: &str) -> Result<()> {
        self.store
            .update(
                habit_id,
                FieldDelta::new().progress(WeekProgress::new()),
                Precondition::None,
            )
            .await?;
        Ok(())
    }

    /// Point the habit at the next reset day strictly after `now`.
    pub async fn assign_next_reset(
        &self,
        habit_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let next_reset = week::next_reset_after(now, self.config.reset_day);
        self.store
            .update(
                habit_id,
                FieldDelta::new().next_reset(next_reset),
                Precondition::None,
            )
            .await?;
        Ok(next_reset)
    }

    /// Restore the skip-day allowance to the complement of the target.
    pub async fn reset_skip_days(&self, habit_id: &str) -> Result<()> {
        let habit = self.store.get(habit_id).await?;
        let skip_days = (DAYS_PER_WEEK as u8).saturating_sub(habit.frequency);
        self.store
            .update(
                habit_id,
                FieldDelta::new().skip_days(skip_days),
                Precondition::None,
            )
            .await?;
        Ok(())
    }

    /// Roll a habit into a fresh week: clear the window, schedule the
    /// next reset, restore the skip-day allowance.
    ///
    /// Each step is an independent write; a failure part-way leaves the
    /// earlier steps applied, and the next sweep picks the habit up
    /// again. The streak itself is not touched here.
    pub async fn rollover(&self, habit_id: &str) -> Result<()> {
        let now = Utc::now();
        self.reset_progress(habit_id).await?;
        let next_reset = self.assign_next_reset(habit_id, now).await?;
        self.reset_skip_days(habit_id).await?;

        tracing::info!("rolled '{habit_id}' into the week ending {next_reset}");
        self.events.emit(TrackerEvent::WeekRolledOver {
            habit_id: habit_id.to_string(),
            next_reset,
            at: now,
        });
        Ok(())
    }

    /// Sweep `habits` and roll over every one whose window has expired.
    ///
    /// Rollovers run concurrently, one task per due habit; one failure
    /// does not stop the others.
    pub async fn check_and_rollover(&self, habits: &[Habit]) -> RolloverReport {
        let now = Utc::now();
        let due: Vec<String> = habits
            .iter()
            .filter(|habit| habit.due_for_rollover(now))
            .map(|habit| habit.id.clone())
            .collect();

        let mut report = RolloverReport {
            checked: habits.len(),
            ..Default::default()
        };

        let mut handles = Vec::with_capacity(due.len());
        for habit_id in due {
            let tracker = self.clone();
            handles.push(tokio::spawn(async move {
                let result = tracker.rollover(&habit_id).await;
                (habit_id, result)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((_, Ok(()))) => report.rolled_over += 1,
                Ok((habit_id, Err(err))) => {
                    tracing::warn!("rollover of '{habit_id}' failed: {err}");
                    report.failed.push((habit_id, err));
                }
                Err(join_err) => {
                    tracing::error!("rollover task panicked: {join_err}");
                }
            }
        }
        report
    }

    /// Subscribe to one user's habits through the underlying store.
    pub async fn watch(&self, uid: &str) -> Result<HabitStream> {
        Ok(self.store.watch(uid).await?)
    }

    /// Sweep each snapshot of `uid`'s habits as it arrives, until the
    /// stream ends.
    ///
    /// Snapshots published by a rollover's own first writes can re-trigger
    /// the sweep; the rollover writes are absolute values, so repeats
    /// converge and the loop settles once `next_reset` is in the future.
    pub async fn watch_and_rollover(&self, uid: &str) -> Result<()> {
        let mut stream = self.store.watch(uid).await?;
        while let Some(snapshot) = stream.next().await {
            let report = self.check_and_rollover(&snapshot.habits).await;
            if !report.failed.is_empty() {
                tracing::warn!(
                    "{} rollover(s) failed for uid '{uid}'",
                    report.failed.len()
                );
            }
        }
        Ok(())
    }
}
