use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flywheel_core::config::{DEFAULT_MAX_RETRIES, DEFAULT_TASK_TIMEOUT_SECS};

/// Keyword-style argument payload handed to a job body.
///
/// Stored as a JSON object in the `tasks.args` column; `NULL` means the job
/// is invoked with an empty map.
pub type JobArgs = serde_json::Map<String, Value>;

/// Lifecycle state of a task row.
///
/// The uppercase strings are the persisted wire contract shared with every
/// producer that inserts task rows directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for `scheduled_at`; picked up by the poller once due.
    Pending,
    /// Claimed by a worker slot and currently executing.
    Running,
    /// Finished normally.
    Completed,
    /// Retry budget exhausted; terminal.
    Failed,
    /// Parked by an external collaborator before execution; terminal.
    Cancelled,
    /// Reserved — the engine never produces this state.
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            "TIMEOUT" => Ok(TaskStatus::Timeout),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Conventional priority levels for the bare-integer `priority` column.
///
/// Higher values are served first. Producers are free to use any integer;
/// these are the values the surrounding application uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl From<TaskPriority> for i64 {
    fn from(priority: TaskPriority) -> Self {
        priority as i64
    }
}

/// Outcome payload persisted in the `tasks.result` column on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whatever the job body returned.
    pub result: Value,
    /// Measured wall-clock duration of the invocation.
    pub execution_time_ms: u64,
}

/// A persisted unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// SQLite rowid — durable surrogate key.
    pub id: i64,
    /// Human-readable label.
    pub name: String,
    /// Name of the registered job this task invokes. Not a database-level
    /// foreign key; resolution happens against the in-memory registry.
    pub func_name: String,
    /// JSON object expanded into the job's named arguments.
    pub args: Option<JobArgs>,
    pub status: TaskStatus,
    /// Bare integer, higher served first (see [`TaskPriority`]).
    pub priority: i64,
    /// Failed attempts so far; bounded by `max_retries`.
    pub retry_count: u32,
    /// Per-task retry budget.
    pub max_retries: u32,
    /// Earliest eligible execution time.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    /// Last failure message, if any attempt failed.
    pub error: Option<String>,
    /// Advisory timeout in seconds. Nothing interrupts an overrunning job;
    /// the engine only logs when this is exceeded.
    pub timeout: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; rows with this set are invisible to the poller.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Insert payload for a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub func_name: String,
    pub args: Option<JobArgs>,
    pub priority: i64,
    pub scheduled_at: DateTime<Utc>,
    pub max_retries: u32,
    pub timeout: u32,
}

impl NewTask {
    /// A task with normal priority and the default retry/timeout budget.
    pub fn new(
        name: impl Into<String>,
        func_name: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            func_name: func_name.into(),
            args: None,
            priority: TaskPriority::Normal.into(),
            scheduled_at,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TASK_TIMEOUT_SECS,
        }
    }

    /// Clone a completed recurring task into its next scheduled run.
    ///
    /// Carries over everything that describes the work (`name`, `func_name`,
    /// `args`, `priority`, `max_retries`, `timeout`); retry bookkeeping and
    /// outcome start fresh.
    pub fn next_run(task: &Task, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            name: task.name.clone(),
            func_name: task.func_name.clone(),
            args: task.args.clone(),
            priority: task.priority,
            scheduled_at,
            max_retries: task.max_retries,
            timeout: task.timeout,
        }
    }

    pub fn with_args(mut self, args: JobArgs) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_priority(mut self, priority: impl Into<i64>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout = timeout_secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ] {
            let parsed: TaskStatus = status.as_str().parse().expect("parse failed");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("pending".parse::<TaskStatus>().is_err());
        assert!("".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn priority_levels_map_to_conventional_integers() {
        assert_eq!(i64::from(TaskPriority::Low), 0);
        assert_eq!(i64::from(TaskPriority::Normal), 1);
        assert_eq!(i64::from(TaskPriority::High), 2);
        assert_eq!(i64::from(TaskPriority::Urgent), 3);
    }

    #[test]
    fn new_task_defaults() {
        let task = NewTask::new("label", "some_job", chrono::Utc::now());
        assert_eq!(task.priority, 1);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.timeout, 300);
        assert!(task.args.is_none());
    }

    #[test]
    fn builders_override_defaults() {
        let mut args = JobArgs::new();
        args.insert("x".into(), serde_json::json!(42));
        let task = NewTask::new("label", "some_job", chrono::Utc::now())
            .with_priority(TaskPriority::Urgent)
            .with_max_retries(1)
            .with_timeout(30)
            .with_args(args);
        assert_eq!(task.priority, 3);
        assert_eq!(task.max_retries, 1);
        assert_eq!(task.timeout, 30);
        assert!(task.args.is_some());
    }

    #[test]
    fn task_result_wire_format() {
        let result = TaskResult {
            result: serde_json::json!("ok"),
            execution_time_ms: 12,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains(r#""result":"ok""#));
        assert!(json.contains(r#""execution_time_ms":12"#));
    }
}
