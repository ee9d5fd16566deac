use rusqlite::Connection;

use crate::error::Result;

/// Initialise the task-queue schema in `conn`.
///
/// Creates the `tasks` table (idempotent) and an index covering the polling
/// query so due-task selection stays efficient with a large backlog.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT    NOT NULL,
            func_name    TEXT    NOT NULL,   -- registry lookup key, not a DB foreign key
            args         TEXT,               -- JSON object or NULL
            status       TEXT    NOT NULL DEFAULT 'PENDING',
            priority     INTEGER NOT NULL DEFAULT 1,
            retry_count  INTEGER NOT NULL DEFAULT 0,
            max_retries  INTEGER NOT NULL DEFAULT 3,
            scheduled_at TEXT    NOT NULL,   -- RFC 3339, earliest eligible run
            started_at   TEXT,
            completed_at TEXT,
            result       TEXT,               -- JSON: value + execution_time_ms
            error        TEXT,               -- last failure message
            timeout      INTEGER NOT NULL DEFAULT 300,  -- seconds, advisory only
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL,
            deleted_at   TEXT                -- soft delete; hidden from the poller
        ) STRICT;

        -- Efficient polling: WHERE status = 'PENDING' AND scheduled_at <= ?
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, scheduled_at);
        ",
    )?;
    Ok(())
}
