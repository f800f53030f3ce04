//! Sync runtime: sessions, the synchronizer, crash recovery, the
//! multi-company queue, and the cron trigger.
//!
//! The synchronizer drives extraction from the gateway into the store in two
//! modes (full refresh and incremental diff) under a single-active-session
//! invariant with cooperative cancellation; the queue serialises per-company
//! jobs and the scheduler fires the same entry points on a cron expression.

pub mod outcome;
pub mod queue;
pub mod recover;
pub mod schedule;
pub mod session;
pub mod sync;

pub use outcome::{
    status_matches, Outcome, STATUS_CANCELLED, STATUS_COMPLETED, STATUS_FAILED, STATUS_NOT_RUNNING,
    STATUS_STARTED,
};
pub use queue::{QueueItem, QueueStatus, SyncQueue};
pub use recover::{CrashState, Recoverer};
pub use schedule::{ScheduleStatus, Scheduler};
pub use session::{SessionSnapshot, SessionStatus, SessionTracker, SyncKind};
pub use sync::Synchronizer;
