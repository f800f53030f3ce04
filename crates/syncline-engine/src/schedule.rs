use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use cron::Schedule;
use serde::Serialize;
use syncline_core::config::ScheduleConfig;
use syncline_core::error::SyncError;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::outcome::Outcome;
use crate::sync::Synchronizer;

/// Pollable scheduler view.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub config: ScheduleConfig,
    pub next_run: Option<String>,
}

struct SchedulerInner {
    config: ScheduleConfig,
    job: Option<JoinHandle<()>>,
}

/// Cron-like trigger for unattended syncs.
///
/// Holds at most one scheduled job; updating the configuration replaces it.
/// The trigger invokes the same synchronizer entry points as manual calls.
pub struct Scheduler {
    synchronizer: Arc<Synchronizer>,
    company: String,
    inner: Mutex<SchedulerInner>,
}

/// `{time, days}` compiled into a six-field cron expression evaluated in
/// local time, e.g. `0 0 6 * * Mon,Tue,Wed,Thu,Fri,Sat`.
fn cron_expression(config: &ScheduleConfig) -> Result<Schedule, SyncError> {
    let mut parts = config.time.split(':');
    let hour: u8 = parts
        .next()
        .and_then(|part| part.trim().parse().ok())
        .filter(|hour| *hour < 24)
        .ok_or_else(|| SyncError::Config(format!("invalid schedule time '{}'", config.time)))?;
    let minute: u8 = parts
        .next()
        .and_then(|part| part.trim().parse().ok())
        .filter(|minute| *minute < 60)
        .ok_or_else(|| SyncError::Config(format!("invalid schedule time '{}'", config.time)))?;
    if config.days.is_empty() {
        return Err(SyncError::Config("schedule has no days".to_string()));
    }
    const DAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
    for day in &config.days {
        if !DAYS.contains(&day.to_ascii_lowercase().as_str()) {
            return Err(SyncError::Config(format!("invalid schedule day '{day}'")));
        }
    }
    let days = config
        .days
        .iter()
        .map(|day| day.to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(",");
    let expression = format!("0 {minute} {hour} * * {days}");
    Schedule::from_str(&expression)
        .map_err(|err| SyncError::Config(format!("invalid schedule '{expression}': {err}")))
}

impl Scheduler {
    pub fn new(synchronizer: Arc<Synchronizer>, company: &str, config: ScheduleConfig) -> Self {
        Self {
            synchronizer,
            company: company.to_string(),
            inner: Mutex::new(SchedulerInner { config, job: None }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_configured_sync(synchronizer: Arc<Synchronizer>, company: String, kind: String) {
        info!(kind = kind.as_str(), company = company.as_str(), "scheduled sync triggered");
        let outcome = if kind == "full" {
            synchronizer.full_sync(&company, false).await
        } else {
            synchronizer.incremental_sync(&company).await
        };
        if outcome.is(crate::outcome::STATUS_COMPLETED) {
            info!(status = outcome.status.as_str(), "scheduled sync finished");
        } else {
            error!(
                status = outcome.status.as_str(),
                message = outcome.message.as_str(),
                "scheduled sync did not complete"
            );
        }
    }

    /// Applies a new schedule, replacing any existing job.
    pub fn update(self: &Arc<Self>, config: ScheduleConfig) -> Outcome {
        let schedule = if config.enabled {
            match cron_expression(&config) {
                Ok(schedule) => Some(schedule),
                Err(err) => return Outcome::failed(err.to_string()),
            }
        } else {
            None
        };

        let mut inner = self.lock();
        if let Some(job) = inner.job.take() {
            job.abort();
        }
        inner.config = config.clone();

        let Some(schedule) = schedule else {
            info!("schedule disabled");
            return Outcome::completed("schedule disabled");
        };

        let synchronizer = Arc::clone(&self.synchronizer);
        let company = self.company.clone();
        let kind = config.kind.clone();
        inner.job = Some(tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Local).next() else {
                    break;
                };
                let wait = (next - Local::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                Self::run_configured_sync(
                    Arc::clone(&synchronizer),
                    company.clone(),
                    kind.clone(),
                )
                .await;
            }
        }));
        info!(time = config.time.as_str(), "schedule enabled");
        Outcome::completed("schedule updated and enabled")
    }

    /// Fires the configured sync immediately, off the schedule.
    pub fn run_now(self: &Arc<Self>) -> Outcome {
        let kind = self.lock().config.kind.clone();
        let synchronizer = Arc::clone(&self.synchronizer);
        let company = self.company.clone();
        tokio::spawn(async move {
            Self::run_configured_sync(synchronizer, company, kind).await;
        });
        Outcome::started("sync triggered manually")
    }

    pub fn status(&self) -> ScheduleStatus {
        let inner = self.lock();
        let next_run = if inner.config.enabled {
            cron_expression(&inner.config)
                .ok()
                .and_then(|schedule| schedule.upcoming(Local).next())
                .map(|next| next.to_rfc3339())
        } else {
            None
        };
        ScheduleStatus {
            config: inner.config.clone(),
            next_run,
        }
    }

    /// Stops the scheduled job, if any.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if let Some(job) = inner.job.take() {
            job.abort();
        }
    }
}
