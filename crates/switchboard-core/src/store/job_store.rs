use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use super::{opt_dt, to_dt};
use crate::db::Database;
use crate::error::CoreError;
use crate::models::job::{JobRunStatus, ScheduledJob};

const JOB_COLUMNS: &str = "name, owner, cron_expr, last_run_at, next_run_at, last_status, last_error, \
     run_count, created_at, updated_at";

/// Health records for scheduler jobs, keyed by job name.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register (or re-register) a job. Run history survives re-registration.
    pub async fn upsert_registration(
        &self,
        owner: &str,
        name: &str,
        cron_expr: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<ScheduledJob, CoreError> {
        let owner = owner.to_string();
        let key = name.to_string();
        let cron_expr = cron_expr.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO scheduled_jobs (name, owner, cron_expr, next_run_at, run_count, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
                     ON CONFLICT(name) DO UPDATE SET
                       owner = excluded.owner,
                       cron_expr = excluded.cron_expr,
                       next_run_at = excluded.next_run_at,
                       updated_at = excluded.updated_at",
                    rusqlite::params![key, owner, cron_expr, next_run_at.map(|d| d.timestamp_millis()), now],
                )?;
                conn.query_row(
                    &format!("SELECT {} FROM scheduled_jobs WHERE name = ?1", JOB_COLUMNS),
                    rusqlite::params![key],
                    |row| Ok(row_to_job(row)),
                )
            })
            .await
    }

    pub async fn get(&self, name: &str) -> Result<Option<ScheduledJob>, CoreError> {
        let key = name.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM scheduled_jobs WHERE name = ?1", JOB_COLUMNS),
                    rusqlite::params![key],
                    |row| Ok(row_to_job(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<ScheduledJob>, CoreError> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM scheduled_jobs ORDER BY owner ASC, name ASC",
                    JOB_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_job(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn record_next_run(&self, name: &str, next_run_at: Option<DateTime<Utc>>) -> Result<(), CoreError> {
        let key = name.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE scheduled_jobs SET next_run_at = ?2, updated_at = ?3 WHERE name = ?1",
                    rusqlite::params![key, next_run_at.map(|d| d.timestamp_millis()), now],
                )?;
                Ok(())
            })
            .await
    }

    /// Record the outcome of one run.
    pub async fn record_run(
        &self,
        name: &str,
        status: JobRunStatus,
        error: Option<String>,
        ran_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let key = name.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE scheduled_jobs SET last_run_at = ?2, last_status = ?3, last_error = ?4,
                     run_count = run_count + 1, updated_at = ?5 WHERE name = ?1",
                    rusqlite::params![key, ran_at.timestamp_millis(), status.as_str(), error, now],
                )?;
                Ok(())
            })
            .await
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> ScheduledJob {
    ScheduledJob {
        name: row.get(0).unwrap_or_default(),
        owner: row.get(1).unwrap_or_default(),
        cron_expr: row.get(2).unwrap_or_default(),
        last_run_at: opt_dt(row.get(3).unwrap_or(None)),
        next_run_at: opt_dt(row.get(4).unwrap_or(None)),
        last_status: row
            .get::<_, Option<String>>(5)
            .unwrap_or(None)
            .and_then(|s| JobRunStatus::from_str(&s)),
        last_error: row.get(6).unwrap_or(None),
        run_count: row.get::<_, i64>(7).unwrap_or(0).max(0) as u64,
        created_at: to_dt(row.get(8).unwrap_or(0)),
        updated_at: to_dt(row.get(9).unwrap_or(0)),
    }
}
