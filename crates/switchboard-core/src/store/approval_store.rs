use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use super::{opt_dt, to_dt, Transition};
use crate::db::Database;
use crate::error::CoreError;
use crate::models::approval::{ApprovalItem, ApprovalStatus};
use crate::models::payload::Payload;

const APPROVAL_COLUMNS: &str = "id, approval_type, status, priority, title, summary, content, created_by, \
     reviewed_by, reviewed_at, feedback, related_task_id, reminder_sent_at, created_at, updated_at";

#[derive(Clone)]
pub struct ApprovalStore {
    db: Database,
}

impl ApprovalStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, item: &ApprovalItem) -> Result<(), CoreError> {
        let a = item.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO approval_queue (id, approval_type, status, priority, title, summary, content,
                     created_by, reviewed_by, reviewed_at, feedback, related_task_id, reminder_sent_at,
                     created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    rusqlite::params![
                        a.id,
                        a.approval_type,
                        a.status.as_str(),
                        a.priority as i64,
                        a.title,
                        a.summary,
                        a.content.to_column(),
                        a.created_by,
                        a.reviewed_by,
                        a.reviewed_at.map(|d| d.timestamp_millis()),
                        a.feedback,
                        a.related_task_id,
                        a.reminder_sent_at.map(|d| d.timestamp_millis()),
                        a.created_at.timestamp_millis(),
                        a.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ApprovalItem>, CoreError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| select_by_id(conn, &id))
            .await
    }

    /// Pending items, most urgent first, then oldest first.
    pub async fn list_pending(&self) -> Result<Vec<ApprovalItem>, CoreError> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM approval_queue WHERE status = 'pending'
                     ORDER BY priority ASC, created_at ASC, rowid ASC",
                    APPROVAL_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], row_to_approval)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Pending items created before `cutoff` that have not been reminded yet.
    pub async fn needs_reminder(&self, cutoff: DateTime<Utc>) -> Result<Vec<ApprovalItem>, CoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM approval_queue
                     WHERE status = 'pending' AND created_at < ?1 AND reminder_sent_at IS NULL
                     ORDER BY created_at ASC, rowid ASC",
                    APPROVAL_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![cutoff_ms], row_to_approval)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Stamp `reminder_sent_at` on a still-pending item.
    pub async fn record_reminder(&self, id: &str) -> Result<ApprovalItem, CoreError> {
        self.transition(id, |item, now| {
            if item.status != ApprovalStatus::Pending {
                return false;
            }
            item.reminder_sent_at = Some(now);
            item.updated_at = now;
            true
        })
        .await
    }

    /// Close a pending item with a reviewer decision.
    pub async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        reviewed_by: &str,
        feedback: Option<String>,
    ) -> Result<ApprovalItem, CoreError> {
        let reviewer = reviewed_by.to_string();
        self.transition(id, move |item, now| {
            if item.status != ApprovalStatus::Pending {
                return false;
            }
            item.status = status;
            item.reviewed_by = Some(reviewer);
            item.reviewed_at = Some(now);
            item.feedback = feedback;
            item.updated_at = now;
            true
        })
        .await
    }

    /// Reopen an item that was sent back for revision, optionally with new content.
    pub async fn resubmit(&self, id: &str, content: Option<Payload>) -> Result<ApprovalItem, CoreError> {
        self.transition(id, move |item, now| {
            if item.status != ApprovalStatus::RevisionRequested {
                return false;
            }
            item.status = ApprovalStatus::Pending;
            if let Some(content) = content {
                item.content = content;
            }
            item.reviewed_by = None;
            item.reviewed_at = None;
            item.reminder_sent_at = None;
            item.updated_at = now;
            true
        })
        .await
    }

    async fn transition<F>(&self, id: &str, apply: F) -> Result<ApprovalItem, CoreError>
    where
        F: FnOnce(&mut ApprovalItem, DateTime<Utc>) -> bool + Send + 'static,
    {
        let key = id.to_string();
        let outcome = self
            .db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let Some(mut item) = select_by_id(&tx, &key)? else {
                    return Ok(Transition::Missing);
                };
                let from = item.status;
                if !apply(&mut item, Utc::now()) {
                    return Ok(Transition::Rejected(from));
                }
                tx.execute(
                    "UPDATE approval_queue SET status = ?2, content = ?3, reviewed_by = ?4, reviewed_at = ?5,
                     feedback = ?6, reminder_sent_at = ?7, updated_at = ?8
                     WHERE id = ?1 AND status = ?9",
                    rusqlite::params![
                        item.id,
                        item.status.as_str(),
                        item.content.to_column(),
                        item.reviewed_by,
                        item.reviewed_at.map(|d| d.timestamp_millis()),
                        item.feedback,
                        item.reminder_sent_at.map(|d| d.timestamp_millis()),
                        item.updated_at.timestamp_millis(),
                        from.as_str(),
                    ],
                )?;
                tx.commit()?;
                Ok(Transition::Applied(item))
            })
            .await?;

        match outcome {
            Transition::Applied(item) => Ok(item),
            Transition::Missing => Err(CoreError::NotFound(format!("Approval {} not found", id))),
            Transition::Rejected(status) => Err(CoreError::Conflict(format!(
                "Approval {} is '{}'",
                id,
                status.as_str()
            ))),
        }
    }
}

fn select_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<ApprovalItem>> {
    conn.query_row(
        &format!("SELECT {} FROM approval_queue WHERE id = ?1", APPROVAL_COLUMNS),
        rusqlite::params![id],
        row_to_approval,
    )
    .optional()
}

fn row_to_approval(row: &Row<'_>) -> rusqlite::Result<ApprovalItem> {
    Ok(ApprovalItem {
        id: row.get(0)?,
        approval_type: row.get(1)?,
        status: ApprovalStatus::from_str(&row.get::<_, String>(2)?).unwrap_or(ApprovalStatus::Pending),
        priority: row.get::<_, i64>(3)?.clamp(1, 5) as u8,
        title: row.get(4)?,
        summary: row.get(5)?,
        content: Payload::from_column(&row.get::<_, String>(6)?),
        created_by: row.get(7)?,
        reviewed_by: row.get(8)?,
        reviewed_at: opt_dt(row.get(9)?),
        feedback: row.get(10)?,
        related_task_id: row.get(11)?,
        reminder_sent_at: opt_dt(row.get(12)?),
        created_at: to_dt(row.get(13)?),
        updated_at: to_dt(row.get(14)?),
    })
}
