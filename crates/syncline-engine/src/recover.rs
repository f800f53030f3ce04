use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use syncline_core::fsio::write_text_atomic;
use syncline_core::time_utils::now_iso;
use tracing::warn;

/// Crash-state record persisted to a single-file sidecar at phase
/// boundaries. Present with `status = running` on restart means the previous
/// run was interrupted (crash or cancellation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashState {
    pub kind: String,
    pub status: String,
    pub started_at: String,
    pub current_table: String,
    pub rows_processed: u64,
    pub last_updated: String,
}

/// Writes and reads the crash-state sidecar. Sidecar I/O is best-effort:
/// failing to record progress must never fail the sync itself.
pub struct Recoverer {
    path: PathBuf,
}

impl Recoverer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Records the running state; called at every phase boundary.
    pub fn save(&self, kind: &str, started_at: &str, current_table: &str, rows_processed: u64) {
        let state = CrashState {
            kind: kind.to_string(),
            status: "running".to_string(),
            started_at: started_at.to_string(),
            current_table: current_table.to_string(),
            rows_processed,
            last_updated: now_iso(),
        };
        let serialized = match serde_json::to_string_pretty(&state) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(error = %err, "failed to serialize crash state");
                return;
            }
        };
        if let Err(err) = write_text_atomic(&self.path, &serialized) {
            warn!(error = %err, "failed to save crash state");
        }
    }

    /// Removes the sidecar; called only on successful completion or explicit
    /// operator dismissal.
    pub fn clear(&self) {
        if self.path.exists() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(error = %err, "failed to clear crash state");
            }
        }
    }

    /// The interrupted run, if the sidecar is present and still `running`.
    pub fn incomplete(&self) -> Option<CrashState> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let state: CrashState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "crash state sidecar is unreadable");
                return None;
            }
        };
        (state.status == "running").then_some(state)
    }

    /// Operator acknowledgement of an interrupted run.
    pub fn dismiss(&self) -> bool {
        let present = self.incomplete().is_some();
        self.clear();
        present
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recoverer() -> (tempfile::TempDir, Recoverer) {
        let dir = tempfile::tempdir().expect("tempdir");
        let recoverer = Recoverer::new(dir.path().join("sync-state.json"));
        (dir, recoverer)
    }

    #[test]
    fn interrupted_run_is_visible_until_cleared() {
        let (_dir, recoverer) = recoverer();
        assert!(recoverer.incomplete().is_none());

        recoverer.save("full", "2025-04-01T06:00:00Z", "mst_ledger", 1200);
        let state = recoverer.incomplete().expect("incomplete run visible");
        assert_eq!(state.kind, "full");
        assert_eq!(state.status, "running");
        assert_eq!(state.current_table, "mst_ledger");
        assert_eq!(state.rows_processed, 1200);

        recoverer.clear();
        assert!(recoverer.incomplete().is_none());
    }

    #[test]
    fn save_overwrites_previous_phase() {
        let (_dir, recoverer) = recoverer();
        recoverer.save("full", "2025-04-01T06:00:00Z", "truncate", 0);
        recoverer.save("full", "2025-04-01T06:00:00Z", "trn_voucher", 500);
        let state = recoverer.incomplete().expect("state");
        assert_eq!(state.current_table, "trn_voucher");
        assert_eq!(state.rows_processed, 500);
    }

    #[test]
    fn dismiss_reports_whether_anything_was_pending() {
        let (_dir, recoverer) = recoverer();
        assert!(!recoverer.dismiss());
        recoverer.save("incremental", "2025-04-01T06:00:00Z", "", 0);
        assert!(recoverer.dismiss());
        assert!(!recoverer.dismiss());
    }

    #[test]
    fn unreadable_sidecar_is_ignored() {
        let (_dir, recoverer) = recoverer();
        std::fs::write(recoverer.path.clone(), "{not json").expect("write");
        assert!(recoverer.incomplete().is_none());
    }
}
