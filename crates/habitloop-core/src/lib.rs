//! # HabitLoop Core Library
//!
//! This library provides the core business logic for the HabitLoop habit
//! tracker. It implements a store-agnostic engine where all habit rules
//! live in one place, with thin store backends (in-memory, SQLite, REST)
//! persisting the same habit documents.
//!
//! ## Architecture
//!
//! - **Tracker Engine**: Pure rule decisions over habit documents, wired
//!   to a store with version-guarded writes and bounded retries
//! - **Stores**: A `DocumentStore` trait with in-memory, SQLite, and
//!   REST backends, each fanning out per-user snapshot streams
//! - **Week Windows**: Seven-slot progress windows rolled over on a
//!   configurable weekday
//! - **Storage**: TOML-based configuration under the platform config dir
//!
//! ## Key Components
//!
//! - [`HabitTracker`]: Streak, skip-day, and rollover engine
//! - [`DocumentStore`]: Trait implemented by every backend
//! - [`Habit`]: The habit document shared by all backends
//! - [`Config`]: Application configuration management

pub mod config;
pub mod error;
pub mod events;
pub mod habit;
pub mod store;
pub mod subscription;
pub mod tracker;
pub mod week;

pub use config::{Config, RetryConfig, StoreBackend, StoreConfig, TrackerConfig};
pub use error::{ConfigError, CoreError, Result, StoreError, ValidationError};
pub use events::{EventBus, TrackerEvent};
pub use habit::{Habit, NewHabit, WeekProgress};
pub use store::{
    AnyStore, DocumentStore, FieldDelta, MemoryStore, Precondition, RestStore, RestStoreConfig,
    SqliteStore,
};
pub use subscription::{HabitSnapshot, HabitStream};
pub use tracker::{
    decide_progress, HabitTracker, ProgressChange, ProgressKind, ProgressOutcome, RolloverReport,
};
pub use week::{next_reset_after, whole_days_between, DAYS_PER_WEEK};
