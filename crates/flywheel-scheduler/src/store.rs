use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, instrument};

use crate::error::{Result, SchedulerError};
use crate::types::{NewTask, Task, TaskResult};

const TASK_COLUMNS: &str = "id, name, func_name, args, status, priority, retry_count, \
     max_retries, scheduled_at, started_at, completed_at, result, error, timeout, \
     created_at, updated_at, deleted_at";

/// Thread-safe store for persisted task rows.
///
/// Wraps a single SQLite connection in a `Mutex`; every operation is one
/// short statement, so a mutex is sufficient for a single-node deployment.
/// Clones share the same underlying connection.
#[derive(Clone)]
pub struct TaskStore {
    db: Arc<Mutex<Connection>>,
}

impl TaskStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
        }
    }

    /// Insert a new `PENDING` task row and return the full record.
    #[instrument(skip(self, new), fields(func_name = %new.func_name))]
    pub fn enqueue(&self, new: NewTask) -> Result<Task> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let args_json = new
            .args
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tasks
             (name, func_name, args, status, priority, retry_count, max_retries,
              scheduled_at, timeout, created_at, updated_at)
             VALUES (?1,?2,?3,'PENDING',?4,0,?5,?6,?7,?8,?8)",
            rusqlite::params![
                new.name,
                new.func_name,
                args_json,
                new.priority,
                new.max_retries,
                new.scheduled_at.to_rfc3339(),
                new.timeout,
                now_str
            ],
        )?;
        let id = db.last_insert_rowid();
        debug!(task_id = id, "task enqueued");

        Ok(Task {
            id,
            name: new.name,
            func_name: new.func_name,
            args: new.args,
            status: crate::types::TaskStatus::Pending,
            priority: new.priority,
            retry_count: 0,
            max_retries: new.max_retries,
            scheduled_at: new.scheduled_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            timeout: new.timeout,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    /// Fetch a task by ID, returning `None` if no such row exists.
    pub fn get(&self, id: i64) -> Result<Option<Task>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            [id],
            row_to_task,
        ) {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    /// Select up to `limit` dispatch-eligible tasks: `PENDING`, due at or
    /// before `now`, not soft-deleted. Urgent work first, oldest-due first
    /// within equal priority.
    pub fn select_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'PENDING' AND scheduled_at <= ?1 AND deleted_at IS NULL
             ORDER BY priority DESC, scheduled_at ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![now.to_rfc3339(), limit as i64],
            row_to_task,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Atomically claim a task for execution: `PENDING` → `RUNNING` with
    /// `started_at` stamped, in one conditional UPDATE.
    ///
    /// Returns `None` when the row has vanished, was soft-deleted, or was
    /// already claimed by another worker — the caller must treat all three
    /// the same and skip silently.
    #[instrument(skip(self))]
    pub fn claim(&self, id: i64, now: DateTime<Utc>) -> Result<Option<Task>> {
        let now_str = now.to_rfc3339();
        let db = self.db.lock().unwrap();
        let claimed = db.execute(
            "UPDATE tasks SET status = 'RUNNING', started_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'PENDING' AND deleted_at IS NULL",
            rusqlite::params![id, now_str],
        )?;
        if claimed == 0 {
            return Ok(None);
        }
        match db.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            [id],
            row_to_task,
        ) {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    /// Record a successful run: `COMPLETED`, completion time, result payload.
    #[instrument(skip(self, result))]
    pub fn complete(&self, id: i64, result: &TaskResult, now: DateTime<Utc>) -> Result<()> {
        let result_json = serde_json::to_string(result)?;
        let now_str = now.to_rfc3339();
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE tasks SET status = 'COMPLETED', completed_at = ?2, result = ?3,
                              updated_at = ?2
             WHERE id = ?1",
            rusqlite::params![id, now_str, result_json],
        )?;
        if rows_changed == 0 {
            return Err(SchedulerError::TaskNotFound { id });
        }
        Ok(())
    }

    /// Record a failed attempt with retries remaining: back to `PENDING`,
    /// next attempt at `next_attempt_at`.
    #[instrument(skip(self, error))]
    pub fn mark_retry(
        &self,
        id: i64,
        retry_count: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE tasks SET status = 'PENDING', retry_count = ?2, error = ?3,
                              scheduled_at = ?4, updated_at = ?5
             WHERE id = ?1",
            rusqlite::params![
                id,
                retry_count,
                error,
                next_attempt_at.to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;
        if rows_changed == 0 {
            return Err(SchedulerError::TaskNotFound { id });
        }
        Ok(())
    }

    /// Record a terminal failure: retry budget exhausted, never re-dispatched.
    #[instrument(skip(self, error))]
    pub fn mark_failed(
        &self,
        id: i64,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE tasks SET status = 'FAILED', retry_count = ?2, error = ?3,
                              updated_at = ?4
             WHERE id = ?1",
            rusqlite::params![id, retry_count, error, now.to_rfc3339()],
        )?;
        if rows_changed == 0 {
            return Err(SchedulerError::TaskNotFound { id });
        }
        Ok(())
    }

    /// Reset tasks left in `RUNNING` by a previous process lifetime back to
    /// `PENDING`. Returns the number of rows swept.
    pub fn reset_stale_running(&self) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let swept = db.execute(
            "UPDATE tasks SET status = 'PENDING', updated_at = ?1
             WHERE status = 'RUNNING' AND deleted_at IS NULL",
            [Utc::now().to_rfc3339()],
        )?;
        Ok(swept)
    }

    /// Soft-delete a task, hiding it from the poller. The only removal path;
    /// rows are never hard-deleted.
    #[instrument(skip(self))]
    pub fn soft_delete(&self, id: i64) -> Result<()> {
        let now_str = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE tasks SET deleted_at = ?2, updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            rusqlite::params![id, now_str],
        )?;
        if rows_changed == 0 {
            return Err(SchedulerError::TaskNotFound { id });
        }
        Ok(())
    }

    /// Park a still-`PENDING` task as `CANCELLED`. Collaborator-facing; the
    /// engine itself never cancels. Returns `false` when the task had
    /// already started (or finished) and could not be parked.
    #[instrument(skip(self))]
    pub fn cancel_pending(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE tasks SET status = 'CANCELLED', updated_at = ?2
             WHERE id = ?1 AND status = 'PENDING' AND deleted_at IS NULL",
            rusqlite::params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(rows_changed > 0)
    }

    /// Most recently created live tasks, newest first. Inspection surface
    /// for admin collaborators.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Task>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE deleted_at IS NULL
             ORDER BY id DESC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit as i64], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Whether a live `PENDING` or `RUNNING` row exists for `func_name`.
    /// Used by seeders to avoid queueing duplicate recurring work.
    pub fn has_active(&self, func_name: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let exists: bool = db.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM tasks
                WHERE func_name = ?1 AND deleted_at IS NULL
                  AND status IN ('PENDING', 'RUNNING'))",
            [func_name],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

/// Map a SQLite row (in `TASK_COLUMNS` order) to a `Task`.
fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let args: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    let result: Option<String> = row.get(11)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        func_name: row.get(2)?,
        args: args.and_then(|s| serde_json::from_str(&s).ok()),
        status: status.parse().map_err(|e: String| bad_column(4, e))?,
        priority: row.get(5)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        scheduled_at: get_timestamp(row, 8)?,
        started_at: get_opt_timestamp(row, 9)?,
        completed_at: get_opt_timestamp(row, 10)?,
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(12)?,
        timeout: row.get(13)?,
        created_at: get_timestamp(row, 14)?,
        updated_at: get_timestamp(row, 15)?,
        deleted_at: get_opt_timestamp(row, 16)?,
    })
}

fn get_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(idx, &raw)
}

fn get_opt_timestamp(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_timestamp(idx, &s)).transpose()
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| bad_column(idx, e.to_string()))
}

fn bad_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        message.into(),
    )
}
