use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use syncline_core::error::SyncError;
use syncline_core::time_utils::now_iso;

/// Which flavor of sync a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Full,
    Incremental,
}

impl SyncKind {
    pub fn label(self) -> &'static str {
        match self {
            SyncKind::Full => "full",
            SyncKind::Incremental => "incremental",
        }
    }
}

/// Terminal and non-terminal session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn label(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

/// Pollable view of the current (or most recent) session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub kind: String,
    pub company: String,
    pub status: String,
    pub progress: u8,
    pub current_table: String,
    pub rows_processed: u64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub error: Option<String>,
}

/// Deterministic-format session id: kind, start timestamp, and a short
/// digest suffix so two sessions starting in the same second stay distinct.
pub fn new_session_id(kind: SyncKind) -> String {
    let now = Utc::now();
    let mut hasher = Sha256::new();
    hasher.update(
        now.timestamp_nanos_opt()
            .unwrap_or_default()
            .to_le_bytes(),
    );
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();
    let suffix: String = digest[..4].iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{}_{}_{}", kind.label(), now.format("%Y%m%d_%H%M%S"), suffix)
}

#[derive(Debug, Clone)]
struct SessionState {
    id: String,
    kind: SyncKind,
    company: String,
    status: SessionStatus,
    progress: u8,
    current_table: String,
    rows_processed: u64,
    started_at: String,
    ended_at: Option<String>,
    error: Option<String>,
}

/// Owns the single-active-session invariant and the progress the control
/// surface polls. Exactly one session is non-terminal at a time, enforced by
/// the `active` flag; the cancel flag is read cooperatively between tables.
pub struct SessionTracker {
    active: AtomicBool,
    cancel: AtomicBool,
    state: Mutex<Option<SessionState>>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            state: Mutex::new(None),
        }
    }

    /// Claims the active slot and initialises a fresh running session.
    /// Fails with `Concurrency` while another session is non-terminal.
    pub fn begin(&self, kind: SyncKind, company: &str) -> Result<String, SyncError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::Concurrency);
        }
        self.cancel.store(false, Ordering::SeqCst);
        let id = new_session_id(kind);
        let mut state = self.lock();
        *state = Some(SessionState {
            id: id.clone(),
            kind,
            company: company.to_string(),
            status: SessionStatus::Running,
            progress: 0,
            current_table: String::new(),
            rows_processed: 0,
            started_at: now_iso(),
            ended_at: None,
            error: None,
        });
        Ok(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SessionState>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Requests cooperative cancellation; true when a session was running.
    pub fn request_cancel(&self) -> bool {
        if self.active.load(Ordering::SeqCst) {
            self.cancel.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Progress is a monotonically non-decreasing estimate.
    pub fn set_progress(&self, progress: u8) {
        if let Some(state) = self.lock().as_mut() {
            state.progress = state.progress.max(progress.min(100));
        }
    }

    pub fn set_current_table(&self, table: &str) {
        if let Some(state) = self.lock().as_mut() {
            state.current_table = table.to_string();
        }
    }

    pub fn add_rows(&self, rows: u64) {
        if let Some(state) = self.lock().as_mut() {
            state.rows_processed += rows;
        }
    }

    pub fn rows_processed(&self) -> u64 {
        self.lock().as_ref().map(|state| state.rows_processed).unwrap_or(0)
    }

    pub fn started_at(&self) -> Option<String> {
        self.lock().as_ref().map(|state| state.started_at.clone())
    }

    fn finish(&self, status: SessionStatus, error: Option<String>) {
        if let Some(state) = self.lock().as_mut() {
            state.status = status;
            state.ended_at = Some(now_iso());
            state.error = error;
            if status == SessionStatus::Completed {
                state.progress = 100;
            }
        }
        self.active.store(false, Ordering::SeqCst);
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub fn complete(&self) {
        self.finish(SessionStatus::Completed, None);
    }

    pub fn fail(&self, error: String) {
        self.finish(SessionStatus::Failed, Some(error));
    }

    pub fn mark_cancelled(&self) {
        self.finish(SessionStatus::Cancelled, None);
    }

    /// Current session view, if any session ever ran in this process.
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.lock().as_ref().map(|state| SessionSnapshot {
            id: state.id.clone(),
            kind: state.kind.label().to_string(),
            company: state.company.clone(),
            status: state.status.label().to_string(),
            progress: state.progress,
            current_table: state.current_table.clone(),
            rows_processed: state.rows_processed,
            started_at: state.started_at.clone(),
            ended_at: state.ended_at.clone(),
            error: state.error.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_carry_kind_and_are_unique() {
        let first = new_session_id(SyncKind::Full);
        let second = new_session_id(SyncKind::Incremental);
        assert!(first.starts_with("full_"));
        assert!(second.starts_with("incremental_"));
        assert_ne!(first, second);
        let suffix = first.rsplit('_').next().expect("suffix");
        assert_eq!(suffix.len(), 8);
    }

    #[test]
    fn only_one_session_is_active_at_a_time() {
        let tracker = SessionTracker::new();
        let id = tracker.begin(SyncKind::Full, "ACME").expect("first");
        assert!(matches!(
            tracker.begin(SyncKind::Full, "BETA"),
            Err(SyncError::Concurrency)
        ));
        tracker.complete();
        let next = tracker.begin(SyncKind::Incremental, "BETA").expect("after completion");
        assert_ne!(id, next);
    }

    #[test]
    fn progress_is_monotonic() {
        let tracker = SessionTracker::new();
        tracker.begin(SyncKind::Full, "ACME").expect("begin");
        tracker.set_progress(40);
        tracker.set_progress(20);
        tracker.set_progress(120);
        let snapshot = tracker.snapshot().expect("snapshot");
        assert_eq!(snapshot.progress, 100);
    }

    #[test]
    fn cancel_flag_only_latches_while_running() {
        let tracker = SessionTracker::new();
        assert!(!tracker.request_cancel(), "nothing to cancel");
        tracker.begin(SyncKind::Full, "ACME").expect("begin");
        assert!(tracker.request_cancel());
        assert!(tracker.cancel_requested());
        tracker.mark_cancelled();
        assert!(!tracker.cancel_requested(), "flag resets at terminal state");
        let snapshot = tracker.snapshot().expect("snapshot");
        assert_eq!(snapshot.status, "cancelled");
        assert!(snapshot.ended_at.is_some());
    }

    #[test]
    fn failure_records_the_error() {
        let tracker = SessionTracker::new();
        tracker.begin(SyncKind::Full, "ACME").expect("begin");
        tracker.add_rows(7);
        tracker.fail("gateway unreachable".to_string());
        let snapshot = tracker.snapshot().expect("snapshot");
        assert_eq!(snapshot.status, "failed");
        assert_eq!(snapshot.rows_processed, 7);
        assert_eq!(snapshot.error.as_deref(), Some("gateway unreachable"));
        assert!(!tracker.is_active());
    }
}
