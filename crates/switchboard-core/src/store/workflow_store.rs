use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use super::task_store::insert_row;
use super::{opt_dt, to_dt};
use crate::db::Database;
use crate::error::CoreError;
use crate::models::payload::Payload;
use crate::models::task::AgentTask;
use crate::models::workflow::{StepResult, WorkflowInstance, WorkflowStatus};

const WORKFLOW_COLUMNS: &str = "id, workflow_type, status, current_step, total_steps, payload, \
     step_results, created_at, updated_at, completed_at";

/// Persistence for workflow instances.
///
/// Every state change is a compare-and-set on the columns the caller read,
/// so two concurrent advances of the same instance cannot both win.
#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, instance: &WorkflowInstance) -> Result<(), CoreError> {
        let w = instance.clone();
        let step_results = serde_json::to_string(&w.step_results)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_instances (id, workflow_type, status, current_step, total_steps,
                     payload, step_results, created_at, updated_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        w.id,
                        w.workflow_type,
                        w.status.as_str(),
                        w.current_step as i64,
                        w.total_steps as i64,
                        w.payload.to_column(),
                        step_results,
                        w.created_at.timestamp_millis(),
                        w.updated_at.timestamp_millis(),
                        w.completed_at.map(|d| d.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkflowInstance>, CoreError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| select_by_id(conn, &id))
            .await
    }

    pub async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowInstance>, CoreError> {
        let status = status.map(|s| s.as_str().to_string());
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflow_instances WHERE (?1 IS NULL OR status = ?1)
                     ORDER BY created_at DESC, rowid DESC",
                    WORKFLOW_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status], row_to_workflow)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Running instances last touched before `cutoff`.
    pub async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkflowInstance>, CoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflow_instances WHERE status = 'running' AND updated_at < ?1
                     ORDER BY updated_at ASC",
                    WORKFLOW_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![cutoff_ms], row_to_workflow)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Move an instance from `from` to `to`. Returns `false` when the
    /// instance was not in `from` (or does not exist).
    pub async fn set_status(
        &self,
        id: &str,
        from: WorkflowStatus,
        to: WorkflowStatus,
    ) -> Result<bool, CoreError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        let completed_at = matches!(to, WorkflowStatus::Completed | WorkflowStatus::Failed).then_some(now);
        self.db
            .with_conn_async(move |conn| {
                let changed = conn.execute(
                    "UPDATE workflow_instances SET status = ?3, updated_at = ?4,
                     completed_at = COALESCE(?5, completed_at)
                     WHERE id = ?1 AND status = ?2",
                    rusqlite::params![id, from.as_str(), to.as_str(), now, completed_at],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    /// Mark a running instance completed, provided nobody moved its cursor
    /// since the caller read `expected_step`.
    pub async fn complete(&self, id: &str, expected_step: usize) -> Result<bool, CoreError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let changed = conn.execute(
                    "UPDATE workflow_instances SET status = 'completed', updated_at = ?3, completed_at = ?3
                     WHERE id = ?1 AND status = 'running' AND current_step = ?2",
                    rusqlite::params![id, expected_step as i64, now],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    /// Bump the cursor from `expected_step` and insert the step's task in a
    /// single transaction. Returns `false` without inserting anything when
    /// the instance is no longer running at `expected_step`.
    pub async fn dispatch_step(
        &self,
        id: &str,
        expected_step: usize,
        task: &AgentTask,
    ) -> Result<bool, CoreError> {
        let id = id.to_string();
        let task = task.clone();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let changed = tx.execute(
                    "UPDATE workflow_instances SET current_step = current_step + 1, updated_at = ?3
                     WHERE id = ?1 AND status = 'running' AND current_step = ?2",
                    rusqlite::params![id, expected_step as i64, now],
                )?;
                if changed != 1 {
                    return Ok(false);
                }
                insert_row(&tx, &task)?;
                tx.commit()?;
                Ok(true)
            })
            .await
    }

    /// Append a step's result to the instance's history, in arrival order.
    /// Earlier entries are never rewritten.
    pub async fn append_step_result(&self, id: &str, result: StepResult) -> Result<(), CoreError> {
        let key = id.to_string();
        let found = self
            .db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let raw: Option<String> = tx
                    .query_row(
                        "SELECT step_results FROM workflow_instances WHERE id = ?1",
                        rusqlite::params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(raw) = raw else {
                    return Ok(false);
                };
                let mut results: Vec<StepResult> = serde_json::from_str(&raw).unwrap_or_default();
                results.push(result);
                let encoded = serde_json::to_string(&results)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                tx.execute(
                    "UPDATE workflow_instances SET step_results = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![key, encoded, Utc::now().timestamp_millis()],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if found {
            Ok(())
        } else {
            Err(CoreError::NotFound(format!("Workflow {} not found", id)))
        }
    }
}

fn select_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<WorkflowInstance>> {
    conn.query_row(
        &format!("SELECT {} FROM workflow_instances WHERE id = ?1", WORKFLOW_COLUMNS),
        rusqlite::params![id],
        row_to_workflow,
    )
    .optional()
}

fn row_to_workflow(row: &Row<'_>) -> rusqlite::Result<WorkflowInstance> {
    let step_results: String = row.get(6)?;
    Ok(WorkflowInstance {
        id: row.get(0)?,
        workflow_type: row.get(1)?,
        status: WorkflowStatus::from_str(&row.get::<_, String>(2)?).unwrap_or(WorkflowStatus::Running),
        current_step: row.get::<_, i64>(3)?.max(0) as usize,
        total_steps: row.get::<_, i64>(4)?.max(0) as usize,
        payload: Payload::from_column(&row.get::<_, String>(5)?),
        step_results: serde_json::from_str(&step_results).unwrap_or_default(),
        created_at: to_dt(row.get(7)?),
        updated_at: to_dt(row.get(8)?),
        completed_at: opt_dt(row.get(9)?),
    })
}
