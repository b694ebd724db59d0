pub mod approval_store;
pub mod job_store;
pub mod task_store;
pub mod workflow_store;

pub use approval_store::ApprovalStore;
pub use job_store::JobStore;
pub use task_store::TaskStore;
pub use workflow_store::WorkflowStore;

use chrono::{DateTime, Utc};

/// Millisecond column value to a UTC timestamp.
pub(crate) fn to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

pub(crate) fn opt_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

/// Result of a guarded read-modify-write inside one transaction.
pub(crate) enum Transition<T, S> {
    Applied(T),
    Missing,
    Rejected(S),
}
