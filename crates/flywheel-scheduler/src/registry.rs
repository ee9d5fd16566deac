use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::info;

use crate::types::JobArgs;

/// A blocking job body. Runs on the blocking thread pool.
pub type SyncJobFn = Arc<dyn Fn(JobArgs) -> anyhow::Result<Value> + Send + Sync>;

/// A non-blocking job body. Awaited on the shared runtime.
pub type AsyncJobFn = Arc<dyn Fn(JobArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Calling convention of a registered job, fixed once at registration time.
/// The executor branches on this tag instead of re-detecting capability at
/// dispatch time.
#[derive(Clone)]
pub enum JobKind {
    Sync(SyncJobFn),
    Async(AsyncJobFn),
}

impl std::fmt::Debug for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobKind::Sync(_) => "Sync",
            JobKind::Async(_) => "Async",
        })
    }
}

/// One registered job: a name, a callable, and optional recurrence.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: String,
    pub kind: JobKind,
    /// When set, every successful run queues the next one this many minutes
    /// after completion.
    pub recurrence_minutes: Option<i64>,
}

impl JobDefinition {
    pub fn is_async(&self) -> bool {
        matches!(self.kind, JobKind::Async(_))
    }
}

/// Name-keyed catalogue of executable job bodies.
///
/// Constructed explicitly and shared with the engine as `Arc<JobRegistry>`,
/// so tests can run multiple isolated schedulers in one process. Populate it
/// before the scheduler starts; the engine refuses to start empty.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    /// Register a blocking job body under `name`.
    ///
    /// Registering an already-taken name replaces the previous entry (last
    /// writer wins) and takes effect for all future dispatches.
    pub fn register<F>(&self, name: impl Into<String>, recurrence_minutes: Option<i64>, f: F)
    where
        F: Fn(JobArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(JobDefinition {
            name: name.into(),
            kind: JobKind::Sync(Arc::new(f)),
            recurrence_minutes,
        });
    }

    /// Register an async job body under `name`. Same overwrite semantics as
    /// [`register`](Self::register).
    pub fn register_async<F>(&self, name: impl Into<String>, recurrence_minutes: Option<i64>, f: F)
    where
        F: Fn(JobArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        self.insert(JobDefinition {
            name: name.into(),
            kind: JobKind::Async(Arc::new(f)),
            recurrence_minutes,
        });
    }

    fn insert(&self, def: JobDefinition) {
        let name = def.name.clone();
        let is_async = def.is_async();
        let recurrence = def.recurrence_minutes;
        let replaced = self.jobs.insert(name.clone(), Arc::new(def)).is_some();
        if replaced {
            info!(job = %name, is_async, "job re-registered, previous definition replaced");
        } else {
            info!(job = %name, is_async, recurrence_minutes = ?recurrence, "job registered");
        }
    }

    /// Look up a job by name. `None` means the name was never registered;
    /// the engine escalates that to an execution failure.
    pub fn resolve(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `name` is registered with the async calling convention.
    /// Unregistered names report `false`.
    pub fn is_async(&self, name: &str) -> bool {
        self.resolve(name).is_some_and(|def| def.is_async())
    }

    /// Names of all registered jobs, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.jobs.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call_sync(def: &JobDefinition, args: JobArgs) -> anyhow::Result<Value> {
        match &def.kind {
            JobKind::Sync(f) => f(args),
            JobKind::Async(_) => panic!("expected a sync job"),
        }
    }

    #[test]
    fn register_and_resolve() {
        let registry = JobRegistry::new();
        assert!(registry.is_empty());

        registry.register("double", None, |args| {
            let n = args.get("n").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(n * 2))
        });

        assert_eq!(registry.len(), 1);
        let def = registry.resolve("double").expect("registered");
        assert!(!def.is_async());

        let mut args = JobArgs::new();
        args.insert("n".into(), json!(21));
        assert_eq!(call_sync(&def, args).unwrap(), json!(42));
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        let registry = JobRegistry::new();
        assert!(registry.resolve("nope").is_none());
        assert!(!registry.is_async("nope"));
    }

    #[test]
    fn last_writer_wins_on_reregistration() {
        let registry = JobRegistry::new();
        registry.register("job", None, |_| Ok(json!("first")));
        registry.register("job", Some(10), |_| Ok(json!("second")));

        assert_eq!(registry.len(), 1);
        let def = registry.resolve("job").expect("registered");
        assert_eq!(def.recurrence_minutes, Some(10));
        assert_eq!(call_sync(&def, JobArgs::new()).unwrap(), json!("second"));
    }

    #[test]
    fn async_registration_sets_the_tag() {
        let registry = JobRegistry::new();
        registry.register_async("fetch", None, |_args| {
            Box::pin(async { Ok(json!("done")) })
        });
        registry.register("crunch", None, |_args| Ok(json!(0)));

        assert!(registry.is_async("fetch"));
        assert!(!registry.is_async("crunch"));

        let mut names = registry.names();
        names.sort();
        assert_eq!(names, ["crunch", "fetch"]);
    }
}
