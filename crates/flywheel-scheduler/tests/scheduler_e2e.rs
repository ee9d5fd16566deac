// End-to-end scheduler behaviour over an in-memory SQLite store: dispatch,
// retry, recurrence, ordering, and the start/stop lifecycle.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};

use flywheel_core::config::SchedulerConfig;
use flywheel_scheduler::{
    db, JobArgs, JobRegistry, NewTask, SchedulerEngine, TaskStatus, TaskStore,
};

fn test_store() -> TaskStore {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    db::init_db(&conn).expect("init schema");
    TaskStore::new(conn)
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        max_workers: 2,
        poll_interval_secs: 1,
        batch_size: 10,
        max_retries: 3,
        task_timeout_secs: 300,
        retry_delay_secs: 0,
    }
}

fn args_with(key: &str, value: Value) -> JobArgs {
    let mut args = JobArgs::new();
    args.insert(key.into(), value);
    args
}

#[tokio::test]
async fn sync_job_runs_to_completion_with_result() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("echo", None, |args| {
        Ok(args.get("x").cloned().unwrap_or(Value::Null))
    });
    let engine = SchedulerEngine::new(store.clone(), registry, test_config());

    let task = store
        .enqueue(NewTask::new("echo once", "echo", Utc::now()).with_args(args_with("x", json!(1))))
        .unwrap();

    assert_eq!(engine.run_pending().await, 1);

    let task = store.get(task.id).unwrap().expect("row exists");
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());
    let result = task.result.expect("result stored");
    assert_eq!(result.result, json!(1));
}

#[tokio::test]
async fn async_job_runs_on_the_shared_runtime() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register_async("fetch", None, |args| {
        Box::pin(async move {
            tokio::task::yield_now().await;
            Ok(json!({ "got": args.get("k").cloned() }))
        })
    });
    let engine = SchedulerEngine::new(store.clone(), registry, test_config());

    let task = store
        .enqueue(
            NewTask::new("fetch once", "fetch", Utc::now()).with_args(args_with("k", json!("v"))),
        )
        .unwrap();
    engine.run_pending().await;

    let task = store.get(task.id).unwrap().expect("row exists");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.unwrap().result, json!({ "got": "v" }));
}

#[tokio::test]
async fn failing_job_exhausts_retries_then_fails_terminally() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("boom", None, |_args| -> anyhow::Result<Value> {
        Err(anyhow::anyhow!("boom"))
    });
    let engine = SchedulerEngine::new(store.clone(), registry, test_config());

    let task = store
        .enqueue(NewTask::new("always fails", "boom", Utc::now()).with_max_retries(2))
        .unwrap();

    // attempt 1: retry_count 1, back to PENDING (zero retry delay)
    engine.run_pending().await;
    let mid = store.get(task.id).unwrap().expect("row exists");
    assert_eq!(mid.status, TaskStatus::Pending);
    assert_eq!(mid.retry_count, 1);

    // attempt 2: budget exhausted
    engine.run_pending().await;
    // a third cycle finds nothing eligible and changes nothing
    engine.run_pending().await;

    let done = store.get(task.id).unwrap().expect("row exists");
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.retry_count, 2);
    assert!(done.error.as_deref().unwrap_or("").contains("boom"));
}

#[tokio::test]
async fn retry_backoff_pushes_next_attempt_out() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("boom", None, |_args| -> anyhow::Result<Value> {
        Err(anyhow::anyhow!("boom"))
    });
    let mut config = test_config();
    config.retry_delay_secs = 60;
    let engine = SchedulerEngine::new(store.clone(), registry, config);

    let before = Utc::now();
    let task = store
        .enqueue(NewTask::new("flaky", "boom", before))
        .unwrap();

    engine.run_pending().await;

    let task = store.get(task.id).unwrap().expect("row exists");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert!(task.scheduled_at >= before + Duration::seconds(59));

    // not yet due again, so the next cycle dispatches nothing
    assert_eq!(engine.run_pending().await, 0);
}

#[tokio::test]
async fn recurring_job_queues_exactly_one_next_run() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("tick", Some(5), |_args| Ok(json!("ok")));
    let engine = SchedulerEngine::new(store.clone(), registry, test_config());

    let before = Utc::now();
    let task = store
        .enqueue(NewTask::new("ticker", "tick", before))
        .unwrap();
    engine.run_pending().await;

    let rows = store.list_recent(10).unwrap();
    assert_eq!(rows.len(), 2);

    let original = store.get(task.id).unwrap().expect("row exists");
    assert_eq!(original.status, TaskStatus::Completed);

    let next = rows
        .into_iter()
        .find(|t| t.id != task.id)
        .expect("next run queued");
    assert_eq!(next.status, TaskStatus::Pending);
    assert_eq!(next.func_name, "tick");
    assert_eq!(next.name, "ticker");
    assert_eq!(next.retry_count, 0);
    assert!(next.scheduled_at >= before + Duration::minutes(4));
    assert!(next.scheduled_at <= Utc::now() + Duration::minutes(6));
}

#[tokio::test]
async fn no_recurrence_is_queued_on_failure() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("tick", Some(5), |_args| -> anyhow::Result<Value> {
        Err(anyhow::anyhow!("nope"))
    });
    let engine = SchedulerEngine::new(store.clone(), registry, test_config());

    store
        .enqueue(NewTask::new("ticker", "tick", Utc::now()))
        .unwrap();
    engine.run_pending().await;

    assert_eq!(store.list_recent(10).unwrap().len(), 1);
}

#[tokio::test]
async fn unregistered_job_is_retried_not_dropped() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("some_job", None, |_args| Ok(Value::Null));
    let engine = SchedulerEngine::new(store.clone(), registry, test_config());

    let task = store
        .enqueue(NewTask::new("ghost", "not_registered", Utc::now()))
        .unwrap();
    engine.run_pending().await;

    let task = store.get(task.id).unwrap().expect("row exists");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert!(task
        .error
        .as_deref()
        .unwrap_or("")
        .contains("job not registered: not_registered"));
}

#[tokio::test]
async fn panicking_job_is_contained_and_counted_as_failure() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("kaboom", None, |_args| -> anyhow::Result<Value> {
        panic!("kaboom")
    });
    let engine = SchedulerEngine::new(store.clone(), registry, test_config());

    let task = store
        .enqueue(NewTask::new("explosive", "kaboom", Utc::now()).with_max_retries(1))
        .unwrap();
    engine.run_pending().await;

    let task = store.get(task.id).unwrap().expect("row exists");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap_or("").contains("panicked"));
}

#[tokio::test]
async fn future_tasks_are_not_picked_up_early() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("later", None, |_args| Ok(Value::Null));
    let engine = SchedulerEngine::new(store.clone(), registry, test_config());

    let task = store
        .enqueue(NewTask::new("later", "later", Utc::now() + Duration::minutes(30)))
        .unwrap();
    assert_eq!(engine.run_pending().await, 0);

    let task = store.get(task.id).unwrap().expect("row exists");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
}

#[tokio::test]
async fn batch_executes_all_due_tasks() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("echo", None, |args| {
        Ok(args.get("x").cloned().unwrap_or(Value::Null))
    });
    let engine = SchedulerEngine::new(store.clone(), registry, test_config());

    for i in 0..5 {
        store
            .enqueue(
                NewTask::new(format!("t{i}"), "echo", Utc::now())
                    .with_args(args_with("x", json!(i))),
            )
            .unwrap();
    }
    assert_eq!(engine.run_pending().await, 5);

    for task in store.list_recent(10).unwrap() {
        assert_eq!(task.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn stats_reflect_dispatch_outcomes() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("echo", None, |_args| Ok(json!("ok")));
    registry.register("boom", None, |_args| -> anyhow::Result<Value> {
        Err(anyhow::anyhow!("boom"))
    });
    let engine = SchedulerEngine::new(store.clone(), registry, test_config());

    store
        .enqueue(NewTask::new("good", "echo", Utc::now()))
        .unwrap();
    store
        .enqueue(NewTask::new("bad", "boom", Utc::now()).with_max_retries(1))
        .unwrap();
    engine.run_pending().await;

    let snap = engine.stats().snapshot();
    assert_eq!(snap.total_tasks_dispatched, 2);
    assert_eq!(snap.completed_tasks, 1);
    assert_eq!(snap.failed_tasks, 1);
    assert_eq!(snap.retried_tasks, 0);
    assert_eq!(snap.active_worker_count, 0);
    assert_eq!(snap.queue_depth, 0);
    assert!(snap.last_poll_at.is_some());
    assert!(snap.last_task_completed_at.is_some());
}

#[tokio::test]
async fn start_and_stop_are_idempotent_and_graceful() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("echo", None, |_args| Ok(json!("ok")));
    let engine = SchedulerEngine::new(store.clone(), registry, test_config());

    let task = store
        .enqueue(NewTask::new("background", "echo", Utc::now()))
        .unwrap();

    engine.start();
    assert!(engine.is_running());
    // second start is a warning no-op
    engine.start();

    // one-second poll interval with an immediate first tick
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    engine.stop().await;
    assert!(!engine.is_running());
    // second stop is a warning no-op
    engine.stop().await;

    let task = store.get(task.id).unwrap().expect("row exists");
    assert_eq!(task.status, TaskStatus::Completed);

    // the engine can be started again after a stop
    engine.start();
    assert!(engine.is_running());
    engine.stop().await;
}

#[tokio::test]
async fn empty_registry_refuses_to_start() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    let engine = SchedulerEngine::new(store, registry, test_config());

    engine.start();
    assert!(!engine.is_running());
}

#[tokio::test]
async fn reregistered_job_takes_effect_for_future_dispatches() {
    let store = test_store();
    let registry = Arc::new(JobRegistry::new());
    registry.register("job", None, |_args| Ok(json!("first")));
    let engine = SchedulerEngine::new(store.clone(), Arc::clone(&registry), test_config());

    let one = store.enqueue(NewTask::new("one", "job", Utc::now())).unwrap();
    engine.run_pending().await;
    assert_eq!(
        store.get(one.id).unwrap().unwrap().result.unwrap().result,
        json!("first")
    );

    registry.register("job", None, |_args| Ok(json!("second")));
    let two = store.enqueue(NewTask::new("two", "job", Utc::now())).unwrap();
    engine.run_pending().await;
    assert_eq!(
        store.get(two.id).unwrap().unwrap().result.unwrap().result,
        json!("second")
    );
}
