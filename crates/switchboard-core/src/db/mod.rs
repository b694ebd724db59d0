//! SQLite database layer for the shared agent store.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::CoreError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, CoreError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| CoreError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| CoreError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| CoreError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CoreError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| CoreError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| CoreError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), CoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS agent_tasks (
                    id              TEXT PRIMARY KEY,
                    task_type       TEXT NOT NULL,
                    priority        INTEGER NOT NULL DEFAULT 3,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    assigned_agent  TEXT NOT NULL,
                    payload         TEXT NOT NULL DEFAULT '{}',
                    result          TEXT,
                    created_by      TEXT NOT NULL,
                    due_at          INTEGER,
                    not_before      INTEGER,
                    attempts        INTEGER NOT NULL DEFAULT 0,
                    last_error      TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    completed_at    INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_agent_tasks_pending
                    ON agent_tasks(assigned_agent, status, priority, created_at);

                CREATE TABLE IF NOT EXISTS approval_queue (
                    id                  TEXT PRIMARY KEY,
                    approval_type       TEXT NOT NULL,
                    status              TEXT NOT NULL DEFAULT 'pending',
                    priority            INTEGER NOT NULL DEFAULT 3,
                    title               TEXT NOT NULL,
                    summary             TEXT NOT NULL DEFAULT '',
                    content             TEXT NOT NULL DEFAULT '{}',
                    created_by          TEXT NOT NULL,
                    reviewed_by         TEXT,
                    reviewed_at         INTEGER,
                    feedback            TEXT,
                    related_task_id     TEXT,
                    reminder_sent_at    INTEGER,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_approval_queue_status ON approval_queue(status, created_at);

                CREATE TABLE IF NOT EXISTS workflow_instances (
                    id              TEXT PRIMARY KEY,
                    workflow_type   TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'running',
                    current_step    INTEGER NOT NULL DEFAULT 0,
                    total_steps     INTEGER NOT NULL,
                    payload         TEXT NOT NULL DEFAULT '{}',
                    step_results    TEXT NOT NULL DEFAULT '[]',
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    completed_at    INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_instances_status
                    ON workflow_instances(status, updated_at);

                CREATE TABLE IF NOT EXISTS scheduled_jobs (
                    name            TEXT PRIMARY KEY,
                    owner           TEXT NOT NULL,
                    cron_expr       TEXT NOT NULL,
                    last_run_at     INTEGER,
                    next_run_at     INTEGER,
                    last_status     TEXT,
                    last_error      TEXT,
                    run_count       INTEGER NOT NULL DEFAULT 0,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );
                ",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_tables() {
        let db = Database::open_in_memory().unwrap();
        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .unwrap();
        for expected in ["agent_tasks", "approval_queue", "scheduled_jobs", "workflow_instances"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
    }

    #[test]
    fn test_open_file_database_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("switchboard.db");
        let path = path.to_str().unwrap();
        Database::open(path).unwrap();
        // Re-opening runs the idempotent schema again.
        Database::open(path).unwrap();
    }
}
