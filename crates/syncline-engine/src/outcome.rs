use serde::Serialize;

use crate::session::SessionSnapshot;

/// Stable status vocabulary for every public operation.
pub const STATUS_STARTED: &str = "started";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CANCELLED: &str = "cancelled";
pub const STATUS_NOT_RUNNING: &str = "not_running";

/// Case-insensitive status comparison for callers.
pub fn status_matches(left: &str, right: &str) -> bool {
    left.eq_ignore_ascii_case(right)
}

/// Structured result of a control-surface operation.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSnapshot>,
}

impl Outcome {
    pub fn new(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            message: message.into(),
            session: None,
        }
    }

    pub fn with_session(mut self, session: Option<SessionSnapshot>) -> Self {
        self.session = session;
        self
    }

    pub fn started(message: impl Into<String>) -> Self {
        Self::new(STATUS_STARTED, message)
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self::new(STATUS_COMPLETED, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(STATUS_FAILED, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(STATUS_CANCELLED, message)
    }

    pub fn not_running(message: impl Into<String>) -> Self {
        Self::new(STATUS_NOT_RUNNING, message)
    }

    pub fn is(&self, status: &str) -> bool {
        status_matches(&self.status, status)
    }
}
