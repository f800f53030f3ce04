use std::sync::Arc;

use chrono::DateTime;
use syncline_core::error::SyncError;
use syncline_core::spec::{SpecSet, TableSpec};
use syncline_core::time_utils::now_iso;
use syncline_core::value::{row_i64, row_text, Row};
use syncline_gateway::client::{AlterIds, Gateway};
use syncline_store::audit::AuditRecorder;
use syncline_store::store::{CompanyStateUpdate, Store, ALTER_ID_COLUMN, GUID_COLUMN};
use tracing::{error, info, warn};

use crate::outcome::Outcome;
use crate::recover::Recoverer;
use crate::session::{SessionSnapshot, SessionTracker, SyncKind};

/// Orchestrates extraction from the gateway into the store, per company.
///
/// Two entry points, full refresh and incremental diff, both idempotent
/// under cancellation. Per-table failures are contained so one bad table
/// does not poison the session; store failures and the pre-truncate safety
/// probe are session-fatal.
pub struct Synchronizer {
    gateway: Arc<dyn Gateway>,
    store: Arc<Store>,
    audit: Arc<AuditRecorder>,
    specs: Arc<SpecSet>,
    tracker: SessionTracker,
    recoverer: Recoverer,
    schema_sql: String,
    batch_size: usize,
}

impl Synchronizer {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        store: Arc<Store>,
        audit: Arc<AuditRecorder>,
        specs: Arc<SpecSet>,
        recoverer: Recoverer,
        schema_sql: String,
        batch_size: usize,
    ) -> Self {
        Self {
            gateway,
            store,
            audit,
            specs,
            tracker: SessionTracker::new(),
            recoverer,
            schema_sql,
            batch_size,
        }
    }

    /// Current (or most recent) session view.
    pub fn status(&self) -> Option<SessionSnapshot> {
        self.tracker.snapshot()
    }

    pub fn is_active(&self) -> bool {
        self.tracker.is_active()
    }

    /// Requests cooperative cancellation of the active session.
    pub fn cancel(&self) -> Outcome {
        if self.tracker.request_cancel() {
            info!("sync cancellation requested");
            Outcome::cancelled("cancellation requested; the active phase will stop at the next table boundary")
        } else {
            Outcome::not_running("no sync session is active")
        }
    }

    /// The interrupted run from a previous process, if any.
    pub fn incomplete_run(&self) -> Option<crate::recover::CrashState> {
        self.recoverer.incomplete()
    }

    /// Operator dismissal of the interrupted-run warning.
    pub fn dismiss_incomplete_run(&self) -> Outcome {
        if self.recoverer.dismiss() {
            Outcome::completed("incomplete sync warning dismissed")
        } else {
            Outcome::not_running("no incomplete sync recorded")
        }
    }

    fn table_names(&self) -> Vec<String> {
        self.specs.all().map(|spec| spec.name.clone()).collect()
    }

    fn check_cancel(&self) -> Result<(), SyncError> {
        if self.tracker.cancel_requested() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn record_history_start(
        &self,
        session_id: &str,
        kind: &str,
        company: &str,
        started_at: &str,
    ) -> Option<i64> {
        match self
            .store
            .insert_history(session_id, kind, company, started_at)
        {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "failed to record sync history start");
                None
            }
        }
    }

    fn finalize(
        &self,
        result: Result<(), SyncError>,
        history_id: Option<i64>,
        started_at: &str,
    ) -> Outcome {
        let rows = self.tracker.rows_processed();
        let duration = DateTime::parse_from_rfc3339(started_at)
            .map(|start| (chrono::Utc::now() - start.with_timezone(&chrono::Utc)).num_seconds())
            .unwrap_or(0);
        let (status, error_text, outcome) = match result {
            Ok(()) => {
                self.tracker.complete();
                self.recoverer.clear();
                info!(rows, "sync completed");
                (
                    "completed",
                    None,
                    Outcome::completed(format!("sync completed; {rows} rows processed")),
                )
            }
            Err(SyncError::Cancelled) => {
                self.tracker.mark_cancelled();
                // The sidecar stays so the operator sees the interruption.
                info!(rows, "sync cancelled");
                ("cancelled", None, Outcome::cancelled("sync cancelled"))
            }
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "sync failed");
                self.tracker.fail(message.clone());
                ("failed", Some(message.clone()), Outcome::failed(message))
            }
        };
        if let Some(id) = history_id {
            if let Err(err) =
                self.store
                    .update_history(id, status, rows, duration, error_text.as_deref())
            {
                warn!(error = %err, "failed to record sync history end");
            }
        }
        outcome.with_session(self.tracker.snapshot())
    }

    /// Full refresh: probe, truncate, register, master phase, transaction
    /// phase, watermark update.
    pub async fn full_sync(&self, company: &str, parallel: bool) -> Outcome {
        let session_id = match self.tracker.begin(SyncKind::Full, company) {
            Ok(id) => id,
            Err(err) => return Outcome::failed(err.to_string()),
        };
        let started_at = self.tracker.started_at().unwrap_or_else(now_iso);
        info!(company, parallel, session_id = session_id.as_str(), "full sync started");
        let history_id = self.record_history_start(&session_id, "full", company, &started_at);
        let result = self.run_full(company, parallel, &started_at).await;
        self.finalize(result, history_id, &started_at)
    }

    async fn run_full(
        &self,
        company: &str,
        parallel: bool,
        started_at: &str,
    ) -> Result<(), SyncError> {
        self.store.bootstrap(&self.schema_sql, &self.table_names())?;
        self.recoverer.save("full", started_at, "initializing", 0);

        // Safety probe: never truncate without evidence the gateway is
        // actually serving data for this company.
        let probe_spec = self
            .specs
            .master
            .first()
            .or_else(|| self.specs.transaction.first())
            .ok_or_else(|| SyncError::Config("no table specs loaded".to_string()))?;
        self.tracker.set_current_table(&probe_spec.name);
        let probe_rows = self.gateway.export(probe_spec, company).await?;
        if probe_rows.is_empty() {
            return Err(SyncError::EmptyGateway {
                company: company.to_string(),
            });
        }

        self.recoverer.save("full", started_at, "truncate", 0);
        for spec in self.specs.all() {
            self.store.truncate(&spec.name, company)?;
        }

        // Register the company up front so it exists even if the bulk phase
        // fails; watermarks keep their previous values until success.
        let info = self.gateway.company_info(company).await?;
        let alter_ids = self.gateway.last_alter_ids(company).await?;
        let existing = self.store.company_state(company)?;
        self.store.upsert_company_state(
            company,
            &CompanyStateUpdate {
                guid: info.guid.clone(),
                alter_id: info.alter_id,
                last_alter_id_master: existing
                    .as_ref()
                    .map(|state| state.last_alter_id_master)
                    .unwrap_or(0),
                last_alter_id_transaction: existing
                    .as_ref()
                    .map(|state| state.last_alter_id_transaction)
                    .unwrap_or(0),
                sync_kind: "full".to_string(),
            },
        )?;

        let total = self.specs.len().max(1);
        self.recoverer
            .save("full", started_at, "master_data", self.tracker.rows_processed());
        self.sync_phase(&self.specs.master, company, parallel, 0, total, started_at)
            .await?;
        self.recoverer.save(
            "full",
            started_at,
            "transaction_data",
            self.tracker.rows_processed(),
        );
        self.sync_phase(
            &self.specs.transaction,
            company,
            parallel,
            self.specs.master.len(),
            total,
            started_at,
        )
        .await?;

        // The watermarks observed at the start of this sync become the new
        // incremental baseline.
        self.store
            .update_company_alter_ids(company, alter_ids.master, alter_ids.transaction)?;
        Ok(())
    }

    async fn sync_phase(
        &self,
        specs: &[TableSpec],
        company: &str,
        parallel: bool,
        offset: usize,
        total: usize,
        started_at: &str,
    ) -> Result<(), SyncError> {
        if specs.is_empty() {
            return Ok(());
        }
        if parallel {
            // Extraction fans out; inserts stay sequential in declaration
            // order on the single write connection.
            let mut handles = Vec::with_capacity(specs.len());
            for spec in specs {
                let gateway = Arc::clone(&self.gateway);
                let spec = spec.clone();
                let company = company.to_string();
                handles.push(tokio::spawn(async move {
                    gateway.export(&spec, &company).await
                }));
            }
            for (index, (spec, handle)) in specs.iter().zip(handles).enumerate() {
                self.check_cancel()?;
                self.tracker.set_current_table(&spec.name);
                self.tracker
                    .set_progress((((offset + index) * 100) / total) as u8);
                match handle.await {
                    Ok(Ok(rows)) => self.insert_rows(spec, &rows, company)?,
                    Ok(Err(err)) => {
                        warn!(table = spec.name.as_str(), error = %err, "table extraction failed; continuing")
                    }
                    Err(err) => {
                        warn!(table = spec.name.as_str(), error = %err, "extraction task failed; continuing")
                    }
                }
                self.recoverer
                    .save("full", started_at, &spec.name, self.tracker.rows_processed());
            }
        } else {
            for (index, spec) in specs.iter().enumerate() {
                self.check_cancel()?;
                self.tracker.set_current_table(&spec.name);
                self.tracker
                    .set_progress((((offset + index) * 100) / total) as u8);
                match self.gateway.export(spec, company).await {
                    Ok(rows) => self.insert_rows(spec, &rows, company)?,
                    Err(err) => {
                        warn!(table = spec.name.as_str(), error = %err, "table extraction failed; continuing")
                    }
                }
                self.recoverer
                    .save("full", started_at, &spec.name, self.tracker.rows_processed());
            }
        }
        Ok(())
    }

    fn insert_rows(&self, spec: &TableSpec, rows: &[Row], company: &str) -> Result<(), SyncError> {
        let count = self
            .store
            .bulk_insert(&spec.name, rows, company, self.batch_size)?;
        self.tracker.add_rows(count as u64);
        info!(table = spec.name.as_str(), count, "imported rows");
        Ok(())
    }

    /// Incremental diff: alter-id short-circuit, Primary-table deletions,
    /// filtered import with audit classification, watermark update.
    pub async fn incremental_sync(&self, company: &str) -> Outcome {
        let session_id = match self.tracker.begin(SyncKind::Incremental, company) {
            Ok(id) => id,
            Err(err) => return Outcome::failed(err.to_string()),
        };
        let started_at = self.tracker.started_at().unwrap_or_else(now_iso);
        info!(company, session_id = session_id.as_str(), "incremental sync started");
        let history_id =
            self.record_history_start(&session_id, "incremental", company, &started_at);
        self.audit.start_session(&session_id, "incremental", company);
        let result = self.run_incremental(company, &started_at).await;
        self.audit.end_session();
        self.finalize(result, history_id, &started_at)
    }

    async fn run_incremental(&self, company: &str, started_at: &str) -> Result<(), SyncError> {
        self.store.bootstrap(&self.schema_sql, &self.table_names())?;
        self.recoverer
            .save("incremental", started_at, "initializing", 0);

        let state = self.store.company_state(company)?;
        let last = AlterIds {
            master: state
                .as_ref()
                .map(|state| state.last_alter_id_master)
                .unwrap_or(0),
            transaction: state
                .as_ref()
                .map(|state| state.last_alter_id_transaction)
                .unwrap_or(0),
        };
        let current = self.gateway.last_alter_ids(company).await?;
        info!(
            last_master = last.master,
            last_transaction = last.transaction,
            current_master = current.master,
            current_transaction = current.transaction,
            "alter-id comparison"
        );
        if current == last {
            info!(company, "gateway unchanged; nothing to sync");
            return Ok(());
        }

        let master_changed = current.master != last.master;
        let transaction_changed = current.transaction != last.transaction;
        let changed: Vec<(&TableSpec, i64)> = self
            .specs
            .master
            .iter()
            .filter(|_| master_changed)
            .map(|spec| (spec, last.master))
            .chain(
                self.specs
                    .transaction
                    .iter()
                    .filter(|_| transaction_changed)
                    .map(|spec| (spec, last.transaction)),
            )
            .collect();
        let diff_tables: Vec<&TableSpec> = changed
            .iter()
            .filter(|(spec, _)| spec.is_primary())
            .map(|(spec, _)| *spec)
            .collect();
        let total = (diff_tables.len() + changed.len()).max(1);
        let mut step = 0_usize;

        // Deletions run before upserts so a modified-and-reinserted row is
        // logged as DELETE of the old snapshot plus INSERT of the new one.
        for spec in &diff_tables {
            self.check_cancel()?;
            self.tracker.set_current_table(&spec.name);
            self.tracker.set_progress(((step * 100) / total) as u8);
            step += 1;
            match self.diff_table(spec, company).await {
                Ok(removed) => {
                    if removed > 0 {
                        self.tracker.add_rows(removed as u64);
                        info!(table = spec.name.as_str(), removed, "removed vanished rows");
                    }
                }
                Err(err @ (SyncError::StoreWrite(_) | SyncError::Cancelled)) => return Err(err),
                Err(err) => {
                    warn!(table = spec.name.as_str(), error = %err, "diff staging failed; table skipped")
                }
            }
            self.recoverer.save(
                "incremental",
                started_at,
                &spec.name,
                self.tracker.rows_processed(),
            );
        }

        for (spec, last_alter_id) in &changed {
            self.check_cancel()?;
            self.tracker.set_current_table(&spec.name);
            self.tracker.set_progress(((step * 100) / total) as u8);
            step += 1;
            let filtered = if *last_alter_id > 0 {
                spec.with_filter(&format!("$AlterID > {last_alter_id}"))
            } else {
                (*spec).clone()
            };
            match self.gateway.export(&filtered, company).await {
                Ok(rows) => self.import_rows(spec, &rows, company)?,
                Err(err) => {
                    warn!(table = spec.name.as_str(), error = %err, "table extraction failed; continuing")
                }
            }
            self.recoverer.save(
                "incremental",
                started_at,
                &spec.name,
                self.tracker.rows_processed(),
            );
        }

        self.store.upsert_company_state(
            company,
            &CompanyStateUpdate {
                guid: String::new(),
                alter_id: 0,
                last_alter_id_master: current.master,
                last_alter_id_transaction: current.transaction,
                sync_kind: "incremental".to_string(),
            },
        )?;
        Ok(())
    }

    /// Stages (guid, alterid) for one Primary table, finds vanished and
    /// stale rows, audits each DELETE, then cascades.
    async fn diff_table(&self, spec: &TableSpec, company: &str) -> Result<usize, SyncError> {
        let probe = spec.diff_probe();
        let rows = self.gateway.export(&probe, company).await?;
        self.store.stage_diff(&rows)?;
        let staged = self.store.stage_deletions_for(&spec.name, company)?;
        if staged == 0 {
            return Ok(0);
        }
        for guid in self.store.deletion_candidates()? {
            if let Some(row) = self.store.fetch_row(&spec.name, &guid, company)? {
                self.audit
                    .log_delete(&spec.name, &guid, row_text(&row, "name"), &row);
            }
        }
        self.store
            .cascade_and_delete(&spec.name, &spec.cascade_delete, company)
    }

    /// Upserts one table's changed rows, classifying each Primary row as
    /// INSERT or UPDATE by (guid, company) existence before writing.
    fn import_rows(&self, spec: &TableSpec, rows: &[Row], company: &str) -> Result<(), SyncError> {
        if rows.is_empty() {
            info!(table = spec.name.as_str(), "no changes");
            return Ok(());
        }
        if spec.is_primary() {
            for row in rows {
                let guid = row_text(row, GUID_COLUMN);
                if guid.is_empty() {
                    continue;
                }
                let alter_id = Some(row_i64(row, ALTER_ID_COLUMN));
                match self.store.fetch_row(&spec.name, guid, company)? {
                    Some(before) => self.audit.log_update(
                        &spec.name,
                        guid,
                        row_text(row, "name"),
                        &before,
                        row,
                        alter_id,
                    ),
                    None => {
                        self.audit
                            .log_insert(&spec.name, guid, row_text(row, "name"), row, alter_id)
                    }
                }
            }
        }
        let count = self.store.upsert(&spec.name, rows, company, self.batch_size)?;
        self.tracker.add_rows(count as u64);
        info!(table = spec.name.as_str(), count, "upserted rows");
        Ok(())
    }
}
