use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use super::{opt_dt, to_dt, Transition};
use crate::config::RetryPolicy;
use crate::db::Database;
use crate::error::CoreError;
use crate::models::payload::Payload;
use crate::models::task::{AgentRole, AgentTask, TaskStatus, TaskType};

const TASK_COLUMNS: &str = "id, task_type, priority, status, assigned_agent, payload, result, \
     created_by, due_at, not_before, attempts, last_error, created_at, updated_at, completed_at";

/// Typed access to the `agent_tasks` table.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new task row.
    pub async fn insert(&self, task: &AgentTask) -> Result<(), CoreError> {
        let t = task.clone();
        self.db
            .with_conn_async(move |conn| insert_row(conn, &t))
            .await
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<AgentTask>, CoreError> {
        let id = task_id.to_string();
        self.db
            .with_conn_async(move |conn| select_by_id(conn, &id))
            .await
    }

    /// Pending tasks for `agent`, highest priority (lowest number) first,
    /// then oldest first. Tasks waiting out a retry backoff are skipped.
    pub async fn fetch_pending(
        &self,
        agent: AgentRole,
        now: DateTime<Utc>,
    ) -> Result<Vec<AgentTask>, CoreError> {
        let now_ms = now.timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM agent_tasks
                     WHERE assigned_agent = ?1 AND status = 'pending'
                       AND (not_before IS NULL OR not_before <= ?2)
                     ORDER BY priority ASC, created_at ASC, rowid ASC",
                    TASK_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![agent.as_str(), now_ms], row_to_task)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Most recent tasks, optionally filtered by agent and status.
    pub async fn list(
        &self,
        agent: Option<AgentRole>,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<AgentTask>, CoreError> {
        let agent = agent.map(|a| a.as_str().to_string());
        let status = status.map(|s| s.as_str().to_string());
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM agent_tasks
                     WHERE (?1 IS NULL OR assigned_agent = ?1) AND (?2 IS NULL OR status = ?2)
                     ORDER BY created_at DESC, rowid DESC LIMIT ?3",
                    TASK_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![agent, status, limit as i64], row_to_task)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Every task dispatched for a workflow instance, in dispatch order.
    pub async fn list_by_workflow(&self, workflow_id: &str) -> Result<Vec<AgentTask>, CoreError> {
        let wf = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM agent_tasks
                     WHERE json_extract(payload, '$.data.workflow_id') = ?1
                     ORDER BY created_at ASC, rowid ASC",
                    TASK_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![wf], row_to_task)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn mark_in_progress(&self, task_id: &str) -> Result<AgentTask, CoreError> {
        self.transition(task_id, |task, now| {
            if task.status != TaskStatus::Pending {
                return false;
            }
            task.status = TaskStatus::InProgress;
            task.updated_at = now;
            true
        })
        .await
    }

    pub async fn mark_complete(&self, task_id: &str, result: Payload) -> Result<AgentTask, CoreError> {
        self.transition(task_id, move |task, now| {
            if task.status.is_terminal() {
                return false;
            }
            task.status = TaskStatus::Complete;
            task.result = Some(result);
            task.not_before = None;
            task.completed_at = Some(now);
            task.updated_at = now;
            true
        })
        .await
    }

    /// Record a failed execution. `attempts` always increments; the task
    /// goes back to `pending` behind a backoff while the policy allows,
    /// otherwise it becomes terminally `failed`.
    pub async fn mark_failed(
        &self,
        task_id: &str,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<AgentTask, CoreError> {
        let error = error.to_string();
        let policy = *policy;
        self.transition(task_id, move |task, now| {
            if task.status.is_terminal() {
                return false;
            }
            task.attempts += 1;
            task.last_error = Some(error);
            task.updated_at = now;
            if policy.should_retry(task.attempts) {
                task.status = TaskStatus::Pending;
                let backoff = policy.backoff_for(task.attempts);
                task.not_before = Some(now.checked_add_signed(backoff).unwrap_or(DateTime::<Utc>::MAX_UTC));
            } else {
                task.status = TaskStatus::Failed;
                task.not_before = None;
                task.completed_at = Some(now);
            }
            true
        })
        .await
    }

    /// Load, check and rewrite a task inside one transaction.
    async fn transition<F>(&self, task_id: &str, apply: F) -> Result<AgentTask, CoreError>
    where
        F: FnOnce(&mut AgentTask, DateTime<Utc>) -> bool + Send + 'static,
    {
        let id = task_id.to_string();
        let outcome = self
            .db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let Some(mut task) = select_by_id(&tx, &id)? else {
                    return Ok(Transition::Missing);
                };
                let from = task.status;
                if !apply(&mut task, Utc::now()) {
                    return Ok(Transition::Rejected(from));
                }
                update_state(&tx, &task)?;
                tx.commit()?;
                Ok(Transition::Applied(task))
            })
            .await?;

        match outcome {
            Transition::Applied(task) => {
                tracing::debug!(task_id = %task.id, status = task.status.as_str(), "[TaskStore] Task transitioned");
                Ok(task)
            }
            Transition::Missing => Err(CoreError::NotFound(format!("Task {} not found", task_id))),
            Transition::Rejected(status) => Err(CoreError::Conflict(format!(
                "Task {} cannot transition from '{}'",
                task_id,
                status.as_str()
            ))),
        }
    }
}

/// Insert a task row on an existing connection or transaction.
pub(crate) fn insert_row(conn: &Connection, t: &AgentTask) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO agent_tasks (id, task_type, priority, status, assigned_agent, payload, result,
         created_by, due_at, not_before, attempts, last_error, created_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        rusqlite::params![
            t.id,
            t.task_type.as_str(),
            t.priority as i64,
            t.status.as_str(),
            t.assigned_agent.as_str(),
            t.payload.to_column(),
            t.result.as_ref().map(|r| r.to_column()),
            t.created_by,
            t.due_at.map(|d| d.timestamp_millis()),
            t.not_before.map(|d| d.timestamp_millis()),
            t.attempts as i64,
            t.last_error,
            t.created_at.timestamp_millis(),
            t.updated_at.timestamp_millis(),
            t.completed_at.map(|d| d.timestamp_millis()),
        ],
    )?;
    Ok(())
}

fn update_state(conn: &Connection, t: &AgentTask) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE agent_tasks SET status = ?2, result = ?3, not_before = ?4, attempts = ?5,
         last_error = ?6, updated_at = ?7, completed_at = ?8 WHERE id = ?1",
        rusqlite::params![
            t.id,
            t.status.as_str(),
            t.result.as_ref().map(|r| r.to_column()),
            t.not_before.map(|d| d.timestamp_millis()),
            t.attempts as i64,
            t.last_error,
            t.updated_at.timestamp_millis(),
            t.completed_at.map(|d| d.timestamp_millis()),
        ],
    )?;
    Ok(())
}

fn select_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<AgentTask>> {
    conn.query_row(
        &format!("SELECT {} FROM agent_tasks WHERE id = ?1", TASK_COLUMNS),
        rusqlite::params![id],
        row_to_task,
    )
    .optional()
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<AgentTask> {
    let agent: String = row.get(4)?;
    let assigned_agent = AgentRole::from_str(&agent).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(4, "assigned_agent".into(), rusqlite::types::Type::Text)
    })?;

    Ok(AgentTask {
        id: row.get(0)?,
        task_type: TaskType::parse(&row.get::<_, String>(1)?),
        priority: row.get::<_, i64>(2)?.clamp(1, 5) as u8,
        status: TaskStatus::from_str(&row.get::<_, String>(3)?).unwrap_or(TaskStatus::Pending),
        assigned_agent,
        payload: Payload::from_column(&row.get::<_, String>(5)?),
        result: row
            .get::<_, Option<String>>(6)?
            .map(|s| Payload::from_column(&s)),
        created_by: row.get(7)?,
        due_at: opt_dt(row.get(8)?),
        not_before: opt_dt(row.get(9)?),
        attempts: row.get::<_, i64>(10)?.max(0) as u32,
        last_error: row.get(11)?,
        created_at: to_dt(row.get(12)?),
        updated_at: to_dt(row.get(13)?),
        completed_at: opt_dt(row.get(14)?),
    })
}
