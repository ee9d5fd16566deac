use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Mutable runtime counters maintained by the engine.
///
/// Pure observability surface — nothing here feeds back into scheduling
/// decisions. Shared as `Arc<SchedulerStats>`; counters are relaxed atomics,
/// timestamps sit behind a small mutex.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    active: AtomicU64,
    queued: AtomicU64,
    total_execution_ms: AtomicU64,
    times: Mutex<Timestamps>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Timestamps {
    last_poll: Option<DateTime<Utc>>,
    last_completion: Option<DateTime<Utc>>,
}

impl SchedulerStats {
    pub(crate) fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_started(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_finished(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completion(&self, execution_time_ms: u64, at: DateTime<Utc>) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
        self.times.lock().unwrap().last_completion = Some(at);
    }

    pub(crate) fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_poll(&self, at: DateTime<Utc>) {
        self.times.lock().unwrap().last_poll = Some(at);
    }

    /// Consistent point-in-time view of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let times = *self.times.lock().unwrap();
        let completed = self.completed.load(Ordering::Relaxed);
        let total_ms = self.total_execution_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            total_tasks_dispatched: self.dispatched.load(Ordering::Relaxed),
            completed_tasks: completed,
            failed_tasks: self.failed.load(Ordering::Relaxed),
            retried_tasks: self.retried.load(Ordering::Relaxed),
            active_worker_count: self.active.load(Ordering::Relaxed),
            queue_depth: self.queued.load(Ordering::Relaxed),
            average_execution_ms: if completed > 0 {
                total_ms as f64 / completed as f64
            } else {
                0.0
            },
            last_poll_at: times.last_poll,
            last_task_completed_at: times.last_completion,
        }
    }
}

/// Serialisable snapshot of scheduler health.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_tasks_dispatched: u64,
    /// Tasks that finished normally.
    pub completed_tasks: u64,
    /// Tasks whose retry budget is exhausted (terminal failures).
    pub failed_tasks: u64,
    /// Failed attempts that were rescheduled for another try.
    pub retried_tasks: u64,
    /// Worker slots currently executing a task.
    pub active_worker_count: u64,
    /// Dispatched tasks still waiting for a free worker slot.
    pub queue_depth: u64,
    /// Running average over all completed tasks.
    pub average_execution_ms: f64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_task_completed_at: Option<DateTime<Utc>>,
}
