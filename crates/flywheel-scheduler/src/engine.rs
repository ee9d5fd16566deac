use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use flywheel_core::config::SchedulerConfig;

use crate::registry::{JobDefinition, JobKind, JobRegistry};
use crate::stats::SchedulerStats;
use crate::store::TaskStore;
use crate::types::{JobArgs, NewTask, Task, TaskResult};

/// Polling scheduler and executor.
///
/// A single background task polls the store every `poll_interval_secs` for
/// due rows and hands each one to a worker bounded by a semaphore of
/// `max_workers` slots. Worker failures never escape a slot: every outcome
/// is persisted as task state, and poll-loop errors only delay the next
/// cycle.
pub struct SchedulerEngine {
    inner: Arc<Inner>,
    poll_loop: Mutex<Option<PollLoop>>,
}

struct Inner {
    store: TaskStore,
    registry: Arc<JobRegistry>,
    config: SchedulerConfig,
    stats: Arc<SchedulerStats>,
    /// Worker-pool bound; a dispatched task waits here for a free slot.
    slots: Arc<Semaphore>,
    /// Task IDs dispatched but not yet finished in this process. Keeps
    /// overlapping poll cycles from double-spawning a saturated backlog.
    in_flight: DashMap<i64, ()>,
}

struct PollLoop {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl SchedulerEngine {
    /// Build an engine over `store` and `registry`. Config is read once;
    /// reconfiguring requires a new engine.
    pub fn new(store: TaskStore, registry: Arc<JobRegistry>, config: SchedulerConfig) -> Self {
        if registry.is_empty() {
            warn!("no jobs registered — register all jobs before calling start()");
        } else {
            for name in registry.names() {
                debug!(job = %name, is_async = registry.is_async(&name), "found registered job");
            }
        }
        let slots = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                config,
                stats: Arc::new(SchedulerStats::default()),
                slots,
                in_flight: DashMap::new(),
            }),
            poll_loop: Mutex::new(None),
        }
    }

    /// Runtime counters. Cheap to clone and safe to read from anywhere.
    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.inner.stats)
    }

    pub fn is_running(&self) -> bool {
        self.poll_loop.lock().unwrap().is_some()
    }

    /// Start the polling loop. A no-op (with a warning) if already running;
    /// refuses outright when the registry is empty. Sweeps tasks left in
    /// `RUNNING` by a previous process lifetime back to `PENDING` before the
    /// first poll.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut guard = self.poll_loop.lock().unwrap();
        if guard.is_some() {
            warn!("scheduler is already running");
            return;
        }
        if self.inner.registry.is_empty() {
            error!("no jobs registered — scheduler will not start");
            return;
        }

        match self.inner.store.reset_stale_running() {
            Ok(0) => {}
            Ok(swept) => warn!(count = swept, "stale RUNNING tasks reset to PENDING"),
            Err(e) => error!("stale-task sweep failed: {e}"),
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_loop(Arc::clone(&self.inner), shutdown_rx));
        *guard = Some(PollLoop { shutdown, join });
        info!(jobs = ?self.inner.registry.names(), "scheduler started");
    }

    /// Graceful stop: signal the loop, then wait for it to drain all
    /// in-flight tasks. In-flight work is finished, never cancelled.
    /// A no-op (with a warning) if not running.
    pub async fn stop(&self) {
        let handle = self.poll_loop.lock().unwrap().take();
        let Some(PollLoop { shutdown, join }) = handle else {
            warn!("scheduler is not running");
            return;
        };
        let _ = shutdown.send(true);
        if let Err(e) = join.await {
            error!("poll loop join failed: {e}");
        }
        info!("scheduler stopped");
    }

    /// Run one poll cycle to completion: select due tasks, execute them all,
    /// wait for the last to finish. Returns how many tasks were dispatched.
    ///
    /// This is the deterministic path used by `--once` invocations and the
    /// test suite; the background loop shares the same dispatch logic.
    pub async fn run_pending(&self) -> usize {
        let mut workers = JoinSet::new();
        let dispatched = dispatch_due(&self.inner, &mut workers);
        while workers.join_next().await.is_some() {}
        dispatched
    }
}

/// Main event loop. Polls until `shutdown` flips to `true`, then drains.
async fn run_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    info!(
        poll_interval_secs = inner.config.poll_interval_secs,
        max_workers = inner.config.max_workers,
        batch_size = inner.config.batch_size,
        "poll loop started"
    );

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(
        inner.config.poll_interval_secs.max(1),
    ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut workers: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                // reap finished workers so the set doesn't grow unbounded
                while workers.try_join_next().is_some() {}
                dispatch_due(&inner, &mut workers);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if !workers.is_empty() {
        info!(in_flight = workers.len(), "draining in-flight tasks");
    }
    while workers.join_next().await.is_some() {}
    info!("poll loop exited");
}

/// One poll cycle: fetch due tasks and spawn a worker per task. Never blocks
/// on the pool — workers queue on the semaphore. Query failures are logged
/// and surface as an empty cycle.
fn dispatch_due(inner: &Arc<Inner>, workers: &mut JoinSet<()>) -> usize {
    let now = Utc::now();
    inner.stats.mark_poll(now);

    let due = match inner.store.select_due(inner.config.batch_size, now) {
        Ok(due) => due,
        Err(e) => {
            error!("due-task query failed: {e}");
            return 0;
        }
    };
    if due.is_empty() {
        return 0;
    }
    debug!(count = due.len(), "found due tasks");

    let mut dispatched = 0;
    for task in due {
        // still queued or executing from an earlier cycle
        if inner.in_flight.insert(task.id, ()).is_some() {
            continue;
        }
        inner.stats.record_dispatch();
        dispatched += 1;
        workers.spawn(run_worker(Arc::clone(inner), task.id));
    }
    dispatched
}

/// Worker slot wrapper: waits for a pool permit, runs the task, releases.
async fn run_worker(inner: Arc<Inner>, task_id: i64) {
    let permit = match Arc::clone(&inner.slots).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            // semaphore closed — only possible during teardown
            inner.in_flight.remove(&task_id);
            return;
        }
    };
    inner.stats.worker_started();
    execute_task(&inner, task_id).await;
    inner.stats.worker_finished();
    inner.in_flight.remove(&task_id);
    drop(permit);
}

/// Execute one task end to end: claim, resolve, invoke, persist the outcome,
/// then apply recurrence or retry policy. Every failure mode — unregistered
/// job, vanished row, raised error, panic — lands in persisted task state.
async fn execute_task(inner: &Inner, task_id: i64) {
    let task = match inner.store.claim(task_id, Utc::now()) {
        Ok(Some(task)) => task,
        Ok(None) => {
            debug!(task_id, "task vanished or was claimed elsewhere, skipping");
            return;
        }
        Err(e) => {
            error!(task_id, "task claim failed: {e}");
            return;
        }
    };
    info!(task_id, func = %task.func_name, retry = task.retry_count, "executing task");

    let def = inner.registry.resolve(&task.func_name);
    let outcome = match &def {
        Some(def) => invoke(def, task.args.clone().unwrap_or_default()).await,
        None => Err(format!(
            "job not registered: {} (registered: {:?})",
            task.func_name,
            inner.registry.names()
        )),
    };

    match outcome {
        Ok((value, execution_time_ms)) => {
            let finished = Utc::now();
            if execution_time_ms > u64::from(task.timeout) * 1000 {
                warn!(
                    task_id,
                    execution_time_ms,
                    timeout_secs = task.timeout,
                    "task exceeded its advisory timeout"
                );
            }
            let result = TaskResult {
                result: value,
                execution_time_ms,
            };
            if let Err(e) = inner.store.complete(task.id, &result, finished) {
                error!(task_id, "failed to persist completion: {e}");
                return;
            }
            inner.stats.record_completion(execution_time_ms, finished);
            info!(task_id, execution_time_ms, "task completed");

            if let Some(minutes) = def.as_ref().and_then(|d| d.recurrence_minutes) {
                queue_next_run(inner, &task, minutes);
            }
        }
        Err(message) => apply_retry_policy(inner, &task, &message),
    }
}

/// Invoke the job body with the task's arguments, measuring wall-clock
/// duration. Blocking bodies run on the blocking pool; async bodies are
/// awaited in place. Panics are contained and reported as failures.
async fn invoke(def: &JobDefinition, args: JobArgs) -> Result<(Value, u64), String> {
    let start = Instant::now();
    let result = match &def.kind {
        JobKind::Sync(f) => {
            let f = Arc::clone(f);
            match tokio::task::spawn_blocking(move || f(args)).await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("job panicked: {e}")),
            }
        }
        JobKind::Async(f) => match AssertUnwindSafe(f(args)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("job panicked")),
        },
    };
    let execution_time_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(value) => Ok((value, execution_time_ms)),
        Err(e) => Err(format!("{e:#}")),
    }
}

/// Queue the next run of a recurring job, cloned from the completed task.
fn queue_next_run(inner: &Inner, task: &Task, recurrence_minutes: i64) {
    let next_run = Utc::now() + ChronoDuration::minutes(recurrence_minutes);
    match inner.store.enqueue(NewTask::next_run(task, next_run)) {
        Ok(created) => info!(
            task_id = task.id,
            next_task_id = created.id,
            next_run = %next_run,
            "recurring task re-queued"
        ),
        Err(e) => error!(task_id = task.id, "failed to queue next recurrence: {e}"),
    }
}

/// Bounded retry with fixed backoff; terminal `FAILED` once the budget is
/// spent.
fn apply_retry_policy(inner: &Inner, task: &Task, message: &str) {
    let now = Utc::now();
    let attempts = task.retry_count + 1;
    if attempts >= task.max_retries {
        let final_count = attempts.min(task.max_retries);
        if let Err(e) = inner.store.mark_failed(task.id, final_count, message, now) {
            error!(task_id = task.id, "failed to persist terminal failure: {e}");
            return;
        }
        inner.stats.record_failure();
        warn!(task_id = task.id, retries = final_count, "task permanently failed: {message}");
    } else {
        let next_attempt =
            now + ChronoDuration::seconds(inner.config.retry_delay_secs as i64);
        if let Err(e) = inner
            .store
            .mark_retry(task.id, attempts, message, next_attempt, now)
        {
            error!(task_id = task.id, "failed to persist retry: {e}");
            return;
        }
        inner.stats.record_retry();
        warn!(
            task_id = task.id,
            retry = attempts,
            max_retries = task.max_retries,
            next_attempt = %next_attempt,
            "task failed, retry scheduled: {message}"
        );
    }
}
