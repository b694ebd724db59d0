//! Core error type for the Switchboard engine.
//!
//! `CoreError` is returned by every store, queue, gate and engine operation.
//! Handlers supplied by collaborators (event subscribers, scheduled jobs)
//! return `anyhow::Result` instead and are never allowed to propagate.

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Transient store fault; the caller may retry on its next cycle.
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Illegal state transition (e.g. resolving an already-resolved approval).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Deployment/registration bug: unknown workflow type, unknown step
    /// target, invalid cron expression. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether re-running the same work later could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Database(_) | CoreError::Internal(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(format!("JSON error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::Database("locked".into()).is_retryable());
        assert!(CoreError::Internal("boom".into()).is_retryable());
        assert!(!CoreError::Config("unknown workflow".into()).is_retryable());
        assert!(!CoreError::BadRequest("priority".into()).is_retryable());
        assert!(!CoreError::Conflict("resolved".into()).is_retryable());
    }
}
