use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use syncline_core::time_utils::now_iso;
use tracing::{info, warn};

use crate::outcome::{Outcome, STATUS_CANCELLED, STATUS_COMPLETED};
use crate::session::SyncKind;
use crate::sync::Synchronizer;

/// Per-company job states inside the queue.
pub const ITEM_PENDING: &str = "pending";
pub const ITEM_RUNNING: &str = "running";
pub const ITEM_COMPLETED: &str = "completed";
pub const ITEM_FAILED: &str = "failed";
pub const ITEM_CANCELLED: &str = "cancelled";

/// One queued per-company sync job.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub company: String,
    pub kind: String,
    pub status: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub rows_processed: u64,
    pub error: Option<String>,
}

/// Pollable queue view.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub is_processing: bool,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub current_index: Option<usize>,
    pub items: Vec<QueueItem>,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: Vec<QueueItem>,
    current_index: Option<usize>,
    completed: usize,
    failed: usize,
}

/// FIFO of per-company sync jobs, processed by a single background worker.
///
/// No concurrency between items: the store is single-writer and the gateway
/// serves one active company at a time, so the worker walks the list
/// strictly in order.
pub struct SyncQueue {
    synchronizer: Arc<Synchronizer>,
    inner: Mutex<QueueInner>,
    processing: AtomicBool,
    stop: AtomicBool,
}

impl SyncQueue {
    pub fn new(synchronizer: Arc<Synchronizer>) -> Self {
        Self {
            synchronizer,
            inner: Mutex::new(QueueInner::default()),
            processing: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the queue contents. Rejected while a worker is processing.
    pub fn add(&self, companies: &[String], kind: SyncKind) -> Outcome {
        if self.processing.load(Ordering::SeqCst) {
            return Outcome::failed("queue is already processing");
        }
        let companies: Vec<&String> = companies
            .iter()
            .filter(|company| !company.trim().is_empty())
            .collect();
        if companies.is_empty() {
            return Outcome::failed("no companies given");
        }
        let mut inner = self.lock();
        inner.items = companies
            .iter()
            .map(|company| QueueItem {
                company: company.trim().to_string(),
                kind: kind.label().to_string(),
                status: ITEM_PENDING.to_string(),
                started_at: None,
                ended_at: None,
                rows_processed: 0,
                error: None,
            })
            .collect();
        inner.current_index = None;
        inner.completed = 0;
        inner.failed = 0;
        info!(count = inner.items.len(), "companies queued for sync");
        Outcome::completed(format!("queued {} companies", inner.items.len()))
    }

    /// Launches the single background worker.
    pub fn start(self: &Arc<Self>) -> Outcome {
        if self.processing.swap(true, Ordering::SeqCst) {
            return Outcome::failed("queue is already processing");
        }
        {
            let inner = self.lock();
            if inner.items.is_empty() {
                self.processing.store(false, Ordering::SeqCst);
                return Outcome::failed("queue is empty");
            }
        }
        self.stop.store(false, Ordering::SeqCst);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.run_worker().await;
        });
        let total = self.lock().items.len();
        Outcome::started(format!("processing {total} queued companies"))
    }

    async fn run_worker(&self) {
        let total = self.lock().items.len();
        for index in 0..total {
            if self.stop.load(Ordering::SeqCst) {
                self.mark_remaining_cancelled(index);
                break;
            }
            let (company, kind) = {
                let mut inner = self.lock();
                inner.current_index = Some(index);
                let item = &mut inner.items[index];
                item.status = ITEM_RUNNING.to_string();
                item.started_at = Some(now_iso());
                (item.company.clone(), item.kind.clone())
            };
            info!(company = company.as_str(), index, total, "queue item started");

            let outcome = if kind == SyncKind::Full.label() {
                self.synchronizer.full_sync(&company, false).await
            } else {
                self.synchronizer.incremental_sync(&company).await
            };

            let rows = outcome
                .session
                .as_ref()
                .map(|session| session.rows_processed)
                .unwrap_or(0);
            let mut stop_after = false;
            {
                let mut inner = self.lock();
                let item = &mut inner.items[index];
                item.ended_at = Some(now_iso());
                item.rows_processed = rows;
                if outcome.is(STATUS_COMPLETED) {
                    item.status = ITEM_COMPLETED.to_string();
                    inner.completed += 1;
                } else if outcome.is(STATUS_CANCELLED) {
                    item.status = ITEM_CANCELLED.to_string();
                    stop_after = true;
                } else {
                    item.status = ITEM_FAILED.to_string();
                    item.error = Some(outcome.message.clone());
                    inner.failed += 1;
                    warn!(company = company.as_str(), error = outcome.message.as_str(), "queue item failed");
                }
            }
            if stop_after {
                self.mark_remaining_cancelled(index + 1);
                break;
            }
        }
        self.processing.store(false, Ordering::SeqCst);
        let inner = self.lock();
        info!(
            completed = inner.completed,
            failed = inner.failed,
            "queue processing finished"
        );
    }

    fn mark_remaining_cancelled(&self, from_index: usize) {
        let mut inner = self.lock();
        for item in inner.items.iter_mut().skip(from_index) {
            if item.status == ITEM_PENDING || item.status == ITEM_RUNNING {
                item.status = ITEM_CANCELLED.to_string();
            }
        }
    }

    /// Cancels the running sync and the remainder of the queue.
    pub fn cancel(&self) -> Outcome {
        if !self.processing.load(Ordering::SeqCst) {
            return Outcome::not_running("queue is not processing");
        }
        self.stop.store(true, Ordering::SeqCst);
        self.synchronizer.cancel();
        Outcome::cancelled("queue cancellation requested")
    }

    /// Empties the queue. Rejected while processing.
    pub fn clear(&self) -> Outcome {
        if self.processing.load(Ordering::SeqCst) {
            return Outcome::failed("cannot clear while processing");
        }
        let mut inner = self.lock();
        inner.items.clear();
        inner.current_index = None;
        inner.completed = 0;
        inner.failed = 0;
        Outcome::completed("queue cleared")
    }

    pub fn status(&self) -> QueueStatus {
        let inner = self.lock();
        QueueStatus {
            is_processing: self.processing.load(Ordering::SeqCst),
            total: inner.items.len(),
            completed: inner.completed,
            failed: inner.failed,
            current_index: inner.current_index,
            items: inner.items.clone(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }
}
