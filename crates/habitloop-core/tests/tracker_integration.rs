//! Integration tests for the habit tracker engine.
//!
//! Tests the full workflow from habit creation to progress updates and
//! weekly rollover, including retry behavior against flaky stores and
//! concurrent writers racing on one document.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, NaiveTime, Utc, Weekday};
use habitloop_core::store::{DocumentStore, FieldDelta, MemoryStore, Precondition};
use habitloop_core::{
    decide_progress, CoreError, Habit, HabitStream, HabitTracker, NewHabit, ProgressKind,
    RetryConfig, StoreError, TrackerConfig, TrackerEvent, ValidationError,
};

fn new_habit(uid: &str, name: &str, frequency: u8) -> NewHabit {
    NewHabit {
        uid: uid.to_string(),
        name: name.to_string(),
        description: "daily practice".to_string(),
        frequency,
        alarm: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
        privacy: false,
        ..NewHabit::default()
    }
}

fn tracker() -> HabitTracker<MemoryStore> {
    HabitTracker::new(Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn test_created_habit_starts_a_fresh_week() {
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();

    assert!(!habit.id.is_empty());
    assert_eq!(habit.streak, 0);
    assert_eq!(habit.skip_days, 2); // 7 minus the weekly target
    assert!(habit.progress.is_clear());
    assert!(habit.next_reset > Utc::now());
    assert_eq!(habit.version, 0);

    // The stored copy matches what the caller got back.
    let stored = tracker.store().get(&habit.id).await.unwrap();
    assert_eq!(stored, habit);
}

#[tokio::test]
async fn test_invalid_frequency_is_rejected_before_storing() {
    let tracker = tracker();
    let err = tracker.create_habit(new_habit("u1", "hourly", 8)).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Validation(ValidationError::FrequencyOutOfRange { frequency: 8 })
    ));
    assert!(tracker.store().is_empty());
}

#[tokio::test]
async fn test_marking_a_day_credits_and_persists() {
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();

    let outcome = tracker.update_progress(&habit.id, 2, true).await.unwrap();
    assert_eq!(outcome.kind, ProgressKind::Credited);
    assert_eq!(outcome.streak, 1);
    assert_eq!(outcome.skip_days, 2); // same day, nothing spent
    assert_eq!(outcome.version, 1);

    let stored = tracker.store().get(&habit.id).await.unwrap();
    assert_eq!(stored.streak, 1);
    assert_eq!(stored.progress.day(2), Some(true));
    assert_eq!(stored.skip_days, 2);
    assert!(stored.last_update >= habit.last_update);
}

#[tokio::test]
async fn test_each_untouched_day_grows_the_streak() {
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 3)).await.unwrap();

    tracker.update_progress(&habit.id, 0, true).await.unwrap();
    tracker.update_progress(&habit.id, 1, true).await.unwrap();
    let outcome = tracker.update_progress(&habit.id, 2, true).await.unwrap();

    assert_eq!(outcome.streak, 3);
    let stored = tracker.store().get(&habit.id).await.unwrap();
    assert_eq!(stored.progress.completed_days(), 3);
    assert!(stored.target_met());
}

#[tokio::test]
async fn test_remarking_a_day_only_flips_the_flag() {
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();

    tracker.update_progress(&habit.id, 3, true).await.unwrap();
    let outcome = tracker.update_progress(&habit.id, 3, false).await.unwrap();

    assert_eq!(outcome.kind, ProgressKind::AlreadyCredited);
    assert_eq!(outcome.streak, 1);
    let stored = tracker.store().get(&habit.id).await.unwrap();
    assert_eq!(stored.progress.day(3), Some(false));
}

#[tokio::test]
async fn test_idle_days_are_spent_from_the_allowance() {
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();

    // Age the document two days without touching anything else.
    tracker
        .store()
        .update(
            &habit.id,
            FieldDelta::new().last_update(Utc::now() - Duration::days(2)),
            Precondition::None,
        )
        .await
        .unwrap();

    let outcome = tracker.update_progress(&habit.id, 2, true).await.unwrap();
    assert_eq!(outcome.kind, ProgressKind::Credited);
    assert_eq!(outcome.days_idle, 2);
    assert_eq!(outcome.skip_days, 0); // both skip days spent
    assert_eq!(outcome.streak, 1);
}

#[tokio::test]
async fn test_gap_beyond_the_allowance_breaks_the_streak() {
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();
    tracker.update_progress(&habit.id, 0, true).await.unwrap();

    tracker
        .store()
        .update(
            &habit.id,
            FieldDelta::new().last_update(Utc::now() - Duration::days(5)),
            Precondition::None,
        )
        .await
        .unwrap();

    let outcome = tracker.update_progress(&habit.id, 4, true).await.unwrap();
    assert_eq!(outcome.kind, ProgressKind::StreakReset);
    assert_eq!(outcome.streak, 0);

    let stored = tracker.store().get(&habit.id).await.unwrap();
    assert_eq!(stored.streak, 0);
    // The day still got marked even though the streak broke.
    assert_eq!(stored.progress.day(4), Some(true));
    // The allowance is restored by rollover, not here.
    assert_eq!(stored.skip_days, 2);
}

#[tokio::test]
async fn test_clearing_an_untouched_day_still_credits() {
    // The credit branch looks at the slot's stored value, not at the
    // flag being written: explicitly unticking a fresh slot counts as
    // activity.
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();

    let outcome = tracker.update_progress(&habit.id, 1, false).await.unwrap();
    assert_eq!(outcome.kind, ProgressKind::Credited);
    assert_eq!(outcome.streak, 1);
    assert_eq!(
        tracker.store().get(&habit.id).await.unwrap().progress.day(1),
        Some(false)
    );
}

#[tokio::test]
async fn test_day_index_out_of_range_is_rejected_without_writing() {
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();

    let err = tracker.update_progress(&habit.id, 7, true).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Validation(ValidationError::DayIndexOutOfRange { index: 7 })
    ));
    assert_eq!(tracker.store().get(&habit.id).await.unwrap().version, 0);
}

#[tokio::test]
async fn test_rollover_resets_window_reset_date_and_allowance() {
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 3)).await.unwrap();

    // Burn the week: mark days, spend the allowance, expire the window.
    tracker.update_progress(&habit.id, 0, true).await.unwrap();
    tracker.update_progress(&habit.id, 1, true).await.unwrap();
    tracker
        .store()
        .update(
            &habit.id,
            FieldDelta::new()
                .skip_days(0)
                .next_reset(Utc::now() - Duration::days(1)),
            Precondition::None,
        )
        .await
        .unwrap();

    let before = tracker.store().get(&habit.id).await.unwrap();
    let report = tracker.check_and_rollover(&[before.clone()]).await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.rolled_over, 1);
    assert!(report.failed.is_empty());

    let after = tracker.store().get(&habit.id).await.unwrap();
    assert!(after.progress.is_clear());
    assert_eq!(after.skip_days, 4); // 7 minus the weekly target of 3
    assert!(after.next_reset > Utc::now());
    // The streak carries across weeks.
    assert_eq!(after.streak, before.streak);
    // Three independent writes: window, reset date, allowance.
    assert_eq!(after.version, before.version + 3);
}

#[tokio::test]
async fn test_sweep_leaves_unexpired_habits_alone() {
    let tracker = tracker();
    let due = tracker.create_habit(new_habit("u1", "due", 3)).await.unwrap();
    let fresh = tracker.create_habit(new_habit("u1", "fresh", 3)).await.unwrap();

    tracker
        .store()
        .update(
            &due.id,
            FieldDelta::new().next_reset(Utc::now() - Duration::hours(1)),
            Precondition::None,
        )
        .await
        .unwrap();

    let habits = vec![
        tracker.store().get(&due.id).await.unwrap(),
        tracker.store().get(&fresh.id).await.unwrap(),
    ];
    let report = tracker.check_and_rollover(&habits).await;
    assert_eq!(report.checked, 2);
    assert_eq!(report.rolled_over, 1);

    // The fresh habit was never written.
    assert_eq!(tracker.store().get(&fresh.id).await.unwrap().version, 0);
}

#[tokio::test]
async fn test_sweep_reports_failures_per_habit() {
    let tracker = tracker();
    let mut ghost = new_habit("u1", "ghost", 3).into_habit(Utc::now(), Weekday::Sun);
    ghost.id = "ghost".to_string();
    ghost.next_reset = Utc::now() - Duration::days(1);

    let report = tracker.check_and_rollover(&[ghost]).await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.rolled_over, 0);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "ghost");
    assert!(matches!(
        report.failed[0].1,
        CoreError::Store(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_watch_and_rollover_sweeps_expired_habits_from_snapshots() {
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();
    tracker
        .store()
        .update(
            &habit.id,
            FieldDelta::new().next_reset(Utc::now() - Duration::days(1)),
            Precondition::None,
        )
        .await
        .unwrap();

    let mut events = tracker.subscribe_events();
    let sweeper = {
        let tracker = tracker.clone();
        tokio::spawn(async move { tracker.watch_and_rollover("u1").await })
    };

    // The seed snapshot carries the expired habit; the sweep rolls it.
    let rolled = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if let TrackerEvent::WeekRolledOver { habit_id, .. } = events.recv().await.unwrap() {
                break habit_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(rolled, habit.id);

    let stored = tracker.store().get(&habit.id).await.unwrap();
    assert!(stored.next_reset > Utc::now());
    sweeper.abort();
}

#[tokio::test]
async fn test_watch_streams_reflect_progress_writes() {
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();

    let mut stream = tracker.watch("u1").await.unwrap();
    let seed = stream.next().await.unwrap();
    assert_eq!(seed.habits.len(), 1);
    assert_eq!(seed.habits[0].streak, 0);

    tracker.update_progress(&habit.id, 0, true).await.unwrap();
    let snapshot = stream.next().await.unwrap();
    assert_eq!(snapshot.habits[0].streak, 1);
    assert_eq!(snapshot.habits[0].progress.day(0), Some(true));
}

#[tokio::test]
async fn test_events_announce_credits_and_breaks() {
    let tracker = tracker();
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();
    tracker
        .store()
        .update(
            &habit.id,
            FieldDelta::new().last_update(Utc::now() - Duration::days(6)),
            Precondition::None,
        )
        .await
        .unwrap();

    let mut events = tracker.subscribe_events();
    tracker.update_progress(&habit.id, 3, true).await.unwrap();

    match events.recv().await.unwrap() {
        TrackerEvent::StreakBroken { habit_id, days_idle, .. } => {
            assert_eq!(habit_id, habit.id);
            assert_eq!(days_idle, 6);
        }
        other => panic!("expected StreakBroken, got {other:?}"),
    }
    match events.recv().await.unwrap() {
        TrackerEvent::ProgressUpdated { day_index, completed, streak, .. } => {
            assert_eq!(day_index, 3);
            assert!(completed);
            assert_eq!(streak, 0);
        }
        other => panic!("expected ProgressUpdated, got {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_marks_on_one_habit_all_land() {
    let config = TrackerConfig {
        retry: RetryConfig {
            max_attempts: 10,
            base_delay_ms: 1,
        },
        ..TrackerConfig::default()
    };
    let tracker = HabitTracker::with_config(Arc::new(MemoryStore::new()), config);
    let habit = tracker.create_habit(new_habit("u1", "stretch", 7)).await.unwrap();

    let mut handles = Vec::new();
    for day in 0..7 {
        let tracker = tracker.clone();
        let id = habit.id.clone();
        handles.push(tokio::spawn(async move {
            tracker.update_progress(&id, day, true).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Every write re-read the latest document, so none were lost.
    let stored = tracker.store().get(&habit.id).await.unwrap();
    assert_eq!(stored.progress.completed_days(), 7);
    assert_eq!(stored.streak, 7);
    assert_eq!(stored.version, 7);
}

// A store whose guarded writes always lose the race.
struct ContendedStore {
    inner: MemoryStore,
}

#[async_trait]
impl DocumentStore for ContendedStore {
    async fn create(&self, habit: &Habit) -> Result<String, StoreError> {
        self.inner.create(habit).await
    }

    async fn get(&self, id: &str) -> Result<Habit, StoreError> {
        self.inner.get(id).await
    }

    async fn update(
        &self,
        id: &str,
        _delta: FieldDelta,
        _precondition: Precondition,
    ) -> Result<u64, StoreError> {
        Err(StoreError::VersionConflict {
            id: id.to_string(),
            expected: 0,
            actual: 1,
        })
    }

    async fn watch(&self, uid: &str) -> Result<HabitStream, StoreError> {
        self.inner.watch(uid).await
    }
}

#[tokio::test]
async fn test_endless_write_races_exhaust_the_attempt_budget() {
    let store = ContendedStore {
        inner: MemoryStore::new(),
    };
    let tracker = HabitTracker::with_config(
        Arc::new(store),
        TrackerConfig {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
            },
            ..TrackerConfig::default()
        },
    );
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();

    let err = tracker.update_progress(&habit.id, 0, true).await.unwrap_err();
    match err {
        CoreError::RetriesExhausted { habit_id, attempts, .. } => {
            assert_eq!(habit_id, habit.id);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

// A store whose writes fail transiently a fixed number of times.
struct FlakyStore {
    inner: MemoryStore,
    failures_left: Mutex<u32>,
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn create(&self, habit: &Habit) -> Result<String, StoreError> {
        self.inner.create(habit).await
    }

    async fn get(&self, id: &str) -> Result<Habit, StoreError> {
        self.inner.get(id).await
    }

    async fn update(
        &self,
        id: &str,
        delta: FieldDelta,
        precondition: Precondition,
    ) -> Result<u64, StoreError> {
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::WriteFailed {
                    id: id.to_string(),
                    message: "simulated outage".to_string(),
                    retryable: true,
                });
            }
        }
        self.inner.update(id, delta, precondition).await
    }

    async fn watch(&self, uid: &str) -> Result<HabitStream, StoreError> {
        self.inner.watch(uid).await
    }
}

#[tokio::test]
async fn test_transient_write_failures_are_retried_with_backoff() {
    let store = FlakyStore {
        inner: MemoryStore::new(),
        failures_left: Mutex::new(2),
    };
    let tracker = HabitTracker::with_config(
        Arc::new(store),
        TrackerConfig {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
            },
            ..TrackerConfig::default()
        },
    );
    let habit = tracker.create_habit(new_habit("u1", "stretch", 5)).await.unwrap();

    // Two outages, then the third attempt lands.
    let outcome = tracker.update_progress(&habit.id, 0, true).await.unwrap();
    assert_eq!(outcome.streak, 1);
    assert_eq!(outcome.version, 1);
}

mod progress_rules {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The allowance never grows and the flag always lands. The streak
        /// resets exactly when the gap exceeds the allowance, whatever the
        /// slot held before.
        #[test]
        fn allowance_and_streak_follow_the_gap(
            streak in 0u32..1000,
            skip in 0u8..=7,
            gap in 0i64..30,
            day in 0usize..7,
            completed in any::<bool>(),
            marked in any::<bool>(),
        ) {
            let last = chrono::DateTime::parse_from_rfc3339("2023-04-03T12:00:00+00:00")
                .unwrap()
                .with_timezone(&Utc);
            let mut habit = new_habit("u1", "stretch", 5).into_habit(last, Weekday::Sun);
            habit.streak = streak;
            habit.skip_days = skip;
            habit.progress.set(day, marked);

            let change =
                decide_progress(&habit, day, completed, last + Duration::days(gap)).unwrap();

            prop_assert!(change.skip_days <= skip, "allowance grew: {} -> {}", skip, change.skip_days);
            prop_assert_eq!(change.progress.day(day), Some(completed));
            prop_assert_eq!(change.days_idle, gap);
            if gap > i64::from(skip) {
                // Reset regardless of the slot's prior value.
                prop_assert_eq!(change.streak, 0, "gap {} over allowance {} must reset", gap, skip);
                prop_assert_eq!(change.skip_days, skip);
            } else if !marked {
                prop_assert_eq!(change.streak, streak + 1);
                prop_assert_eq!(i64::from(change.skip_days), i64::from(skip) - gap);
            } else {
                // An already-marked slot only moves its flag.
                prop_assert_eq!(change.streak, streak);
                prop_assert_eq!(change.skip_days, skip);
            }
        }
    }
}
