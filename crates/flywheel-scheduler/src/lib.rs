//! `flywheel-scheduler` — durable task queue with SQLite persistence and a
//! polling execution engine.
//!
//! # Overview
//!
//! Work is persisted as rows in a SQLite `tasks` table. Collaborators
//! register named job functions in a [`registry::JobRegistry`] at process
//! start and enqueue [`types::Task`] rows through [`store::TaskStore`]. The
//! [`engine::SchedulerEngine`] polls the table for due rows, executes them on
//! a bounded worker pool, and applies the retry and recurrence policy.
//!
//! # Task statuses
//!
//! | Status      | Meaning                                                  |
//! |-------------|----------------------------------------------------------|
//! | `PENDING`   | Waiting for `scheduled_at`; eligible once due            |
//! | `RUNNING`   | Claimed by a worker slot                                 |
//! | `COMPLETED` | Finished normally; `result` holds value + duration       |
//! | `FAILED`    | Retry budget exhausted; never re-dispatched              |
//! | `CANCELLED` | Parked by an external collaborator before execution      |
//! | `TIMEOUT`   | Reserved — no transition currently produces it           |
//!
//! A failed task with retries remaining goes back to `PENDING` with its
//! `scheduled_at` pushed out by the configured fixed retry delay.

pub mod db;
pub mod engine;
pub mod error;
pub mod registry;
pub mod stats;
pub mod store;
pub mod types;

pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use registry::{JobDefinition, JobKind, JobRegistry};
pub use stats::{SchedulerStats, StatsSnapshot};
pub use store::TaskStore;
pub use types::{JobArgs, NewTask, Task, TaskPriority, TaskResult, TaskStatus};
