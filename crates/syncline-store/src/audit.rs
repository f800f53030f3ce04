use std::sync::{Arc, Mutex};

use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use serde_json::Value;
use syncline_core::error::SyncError;
use syncline_core::time_utils::now_iso;
use syncline_core::value::{row_text, Row};
use tracing::{error, info};

use crate::store::Store;

/// Audit action names as stored in `audit_log.action`.
pub const ACTION_INSERT: &str = "INSERT";
pub const ACTION_UPDATE: &str = "UPDATE";
pub const ACTION_DELETE: &str = "DELETE";

#[derive(Debug, Clone)]
struct SessionScope {
    session_id: String,
    sync_kind: String,
    company: String,
}

/// One audit trail entry as returned by the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEventRecord {
    pub id: i64,
    pub session_id: String,
    pub sync_kind: String,
    pub table: String,
    pub row_guid: String,
    pub row_name: String,
    pub action: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub changed_columns: Option<Vec<String>>,
    pub company: String,
    pub gateway_alter_id: Option<i64>,
    pub created_at: String,
}

/// One restorable deleted record.
#[derive(Debug, Clone, Serialize)]
pub struct DeletedRecord {
    pub id: i64,
    pub table: String,
    pub row_guid: String,
    pub row_name: String,
    pub row_data: Value,
    pub company: String,
    pub session_id: String,
    pub deleted_at: String,
    pub is_restored: bool,
}

/// Filters for the audit history query; all optional, ANDed together.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub table: Option<String>,
    pub row_guid: Option<String>,
    pub action: Option<String>,
    pub company: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Aggregate audit counts.
#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub by_action: std::collections::BTreeMap<String, i64>,
    pub by_table: std::collections::BTreeMap<String, i64>,
    pub pending_deleted_records: i64,
}

/// Change summary for one sync session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionChanges {
    pub session_id: String,
    pub summary: std::collections::BTreeMap<String, i64>,
    pub total_changes: usize,
    pub changes: Vec<AuditEventRecord>,
}

/// Records INSERT/UPDATE/DELETE events with before/after snapshots, and keeps
/// a restorable copy of every deleted row.
///
/// Recording is best-effort: a failed audit write is logged and swallowed so
/// the sync itself never aborts because of audit I/O.
pub struct AuditRecorder {
    store: Arc<Store>,
    scope: Mutex<Option<SessionScope>>,
}

impl AuditRecorder {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            scope: Mutex::new(None),
        }
    }

    /// Stamps subsequent events with the session's id, kind, and company.
    pub fn start_session(&self, session_id: &str, sync_kind: &str, company: &str) {
        let mut scope = self.scope.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *scope = Some(SessionScope {
            session_id: session_id.to_string(),
            sync_kind: sync_kind.to_string(),
            company: company.to_string(),
        });
        info!(session_id, "audit session started");
    }

    pub fn end_session(&self) {
        let mut scope = self.scope.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(active) = scope.take() {
            info!(session_id = active.session_id.as_str(), "audit session ended");
        }
    }

    fn current_scope(&self) -> SessionScope {
        self.scope
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| SessionScope {
                session_id: String::new(),
                sync_kind: String::new(),
                company: String::new(),
            })
    }

    pub fn log_insert(&self, table: &str, guid: &str, name: &str, after: &Row, alter_id: Option<i64>) {
        self.log_action(ACTION_INSERT, table, guid, name, None, Some(after), None, alter_id);
    }

    /// Records an UPDATE with its changed column set. A no-op write (empty
    /// diff) is not recorded.
    pub fn log_update(
        &self,
        table: &str,
        guid: &str,
        name: &str,
        before: &Row,
        after: &Row,
        alter_id: Option<i64>,
    ) {
        let changed: Vec<String> = after
            .iter()
            .filter(|(key, new_value)| {
                before
                    .get(*key)
                    .map(|old_value| !values_equal(old_value, new_value))
                    .unwrap_or(true)
            })
            .map(|(key, _)| key.clone())
            .collect();
        if changed.is_empty() {
            return;
        }
        self.log_action(
            ACTION_UPDATE,
            table,
            guid,
            name,
            Some(before),
            Some(after),
            Some(changed),
            alter_id,
        );
    }

    /// Records a DELETE and stores the full snapshot for restoration.
    pub fn log_delete(&self, table: &str, guid: &str, name: &str, before: &Row) {
        self.log_action(ACTION_DELETE, table, guid, name, Some(before), None, None, None);
        let scope = self.current_scope();
        let result = self.store.execute(
            "INSERT INTO deleted_records \
                 (table_name, row_guid, row_name, row_data, company, session_id, deleted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            vec![
                SqlValue::Text(table.to_string()),
                SqlValue::Text(guid.to_string()),
                SqlValue::Text(name.to_string()),
                SqlValue::Text(Value::Object(before.clone()).to_string()),
                SqlValue::Text(scope.company),
                SqlValue::Text(scope.session_id),
                SqlValue::Text(now_iso()),
            ],
        );
        if let Err(err) = result {
            error!(table, guid, error = %err, "failed to store deleted record");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_action(
        &self,
        action: &str,
        table: &str,
        guid: &str,
        name: &str,
        before: Option<&Row>,
        after: Option<&Row>,
        changed_columns: Option<Vec<String>>,
        alter_id: Option<i64>,
    ) {
        let scope = self.current_scope();
        let result = self.store.execute(
            "INSERT INTO audit_log \
                 (session_id, sync_kind, table_name, row_guid, row_name, action, \
                  before_data, after_data, changed_columns, company, gateway_alter_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            vec![
                SqlValue::Text(scope.session_id),
                SqlValue::Text(scope.sync_kind),
                SqlValue::Text(table.to_string()),
                SqlValue::Text(guid.to_string()),
                SqlValue::Text(name.to_string()),
                SqlValue::Text(action.to_string()),
                snapshot_value(before),
                snapshot_value(after),
                changed_columns
                    .map(|columns| SqlValue::Text(Value::from(columns).to_string()))
                    .unwrap_or(SqlValue::Null),
                SqlValue::Text(scope.company),
                alter_id.map(SqlValue::Integer).unwrap_or(SqlValue::Null),
                SqlValue::Text(now_iso()),
            ],
        );
        if let Err(err) = result {
            error!(table, guid, action, error = %err, "failed to record audit event");
        }
    }

    /// Audit history with optional filters, newest first.
    pub fn history(&self, filter: &AuditFilter) -> Result<Vec<AuditEventRecord>, SyncError> {
        let mut sql = String::from(
            "SELECT id, session_id, sync_kind, table_name, row_guid, row_name, action, \
                    before_data, after_data, changed_columns, company, gateway_alter_id, created_at \
             FROM audit_log WHERE 1=1",
        );
        let mut values: Vec<SqlValue> = Vec::new();
        let mut push = |sql: &mut String, clause: &str, value: SqlValue| {
            values.push(value);
            sql.push_str(&format!(" AND {} ?{}", clause, values.len()));
        };
        if let Some(table) = &filter.table {
            push(&mut sql, "table_name =", SqlValue::Text(table.clone()));
        }
        if let Some(guid) = &filter.row_guid {
            push(&mut sql, "row_guid =", SqlValue::Text(guid.clone()));
        }
        if let Some(action) = &filter.action {
            push(&mut sql, "action =", SqlValue::Text(action.to_uppercase()));
        }
        if let Some(company) = &filter.company {
            push(&mut sql, "company =", SqlValue::Text(company.clone()));
        }
        if let Some(start) = &filter.start_date {
            push(&mut sql, "created_at >=", SqlValue::Text(start.clone()));
        }
        if let Some(end) = &filter.end_date {
            push(&mut sql, "created_at <=", SqlValue::Text(end.clone()));
        }
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        values.push(SqlValue::Integer(limit as i64));
        sql.push_str(&format!(" ORDER BY created_at DESC, id DESC LIMIT ?{}", values.len()));
        values.push(SqlValue::Integer(filter.offset as i64));
        sql.push_str(&format!(" OFFSET ?{}", values.len()));

        let rows = self.store.query_rows(&sql, values)?;
        Ok(rows.iter().map(audit_record_from_row).collect())
    }

    /// Full history of one record, newest first.
    pub fn record_history(&self, table: &str, guid: &str) -> Result<Vec<AuditEventRecord>, SyncError> {
        self.history(&AuditFilter {
            table: Some(table.to_string()),
            row_guid: Some(guid.to_string()),
            limit: 1000,
            ..AuditFilter::default()
        })
    }

    /// Everything one sync session changed, oldest first, with a per-action
    /// summary.
    pub fn session_changes(&self, session_id: &str) -> Result<SessionChanges, SyncError> {
        let rows = self.store.query_rows(
            "SELECT id, session_id, sync_kind, table_name, row_guid, row_name, action, \
                    before_data, after_data, changed_columns, company, gateway_alter_id, created_at \
             FROM audit_log WHERE session_id = ?1 ORDER BY created_at, id",
            vec![SqlValue::Text(session_id.to_string())],
        )?;
        let changes: Vec<AuditEventRecord> = rows.iter().map(audit_record_from_row).collect();
        let mut summary = std::collections::BTreeMap::new();
        for change in &changes {
            *summary.entry(change.action.clone()).or_insert(0) += 1;
        }
        Ok(SessionChanges {
            session_id: session_id.to_string(),
            summary,
            total_changes: changes.len(),
            changes,
        })
    }

    /// Deleted records available for restoration.
    pub fn deleted_records(
        &self,
        table: Option<&str>,
        company: Option<&str>,
        include_restored: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeletedRecord>, SyncError> {
        let mut sql = String::from(
            "SELECT id, table_name, row_guid, row_name, row_data, company, session_id, \
                    deleted_at, is_restored \
             FROM deleted_records WHERE 1=1",
        );
        let mut values: Vec<SqlValue> = Vec::new();
        if !include_restored {
            sql.push_str(" AND is_restored = 0");
        }
        if let Some(table) = table {
            values.push(SqlValue::Text(table.to_string()));
            sql.push_str(&format!(" AND table_name = ?{}", values.len()));
        }
        if let Some(company) = company {
            values.push(SqlValue::Text(company.to_string()));
            sql.push_str(&format!(" AND company = ?{}", values.len()));
        }
        let limit = if limit == 0 { 100 } else { limit };
        values.push(SqlValue::Integer(limit as i64));
        sql.push_str(&format!(" ORDER BY deleted_at DESC, id DESC LIMIT ?{}", values.len()));
        values.push(SqlValue::Integer(offset as i64));
        sql.push_str(&format!(" OFFSET ?{}", values.len()));

        let rows = self.store.query_rows(&sql, values)?;
        Ok(rows.iter().map(deleted_record_from_row).collect())
    }

    /// Counts by action and table plus the number of unrestored deletions.
    pub fn stats(&self, company: Option<&str>) -> Result<AuditStats, SyncError> {
        let (where_clause, values) = match company {
            Some(name) => (
                " WHERE company = ?1".to_string(),
                vec![SqlValue::Text(name.to_string())],
            ),
            None => (String::new(), Vec::new()),
        };

        let by_action_rows = self.store.query_rows(
            &format!("SELECT action, COUNT(*) AS n FROM audit_log{where_clause} GROUP BY action"),
            values.clone(),
        )?;
        let by_table_rows = self.store.query_rows(
            &format!(
                "SELECT table_name, COUNT(*) AS n FROM audit_log{where_clause} \
                 GROUP BY table_name ORDER BY n DESC LIMIT 10"
            ),
            values.clone(),
        )?;
        let pending_sql = match company {
            Some(_) => "SELECT COUNT(*) AS n FROM deleted_records WHERE is_restored = 0 AND company = ?1",
            None => "SELECT COUNT(*) AS n FROM deleted_records WHERE is_restored = 0",
        };
        let pending_rows = self.store.query_rows(pending_sql, values)?;

        let count_of = |row: &Row| -> i64 {
            row.get("n").and_then(Value::as_i64).unwrap_or(0)
        };
        Ok(AuditStats {
            by_action: by_action_rows
                .iter()
                .map(|row| (row_text(row, "action").to_string(), count_of(row)))
                .collect(),
            by_table: by_table_rows
                .iter()
                .map(|row| (row_text(row, "table_name").to_string(), count_of(row)))
                .collect(),
            pending_deleted_records: pending_rows.first().map(count_of).unwrap_or(0),
        })
    }

    /// Restores a deleted row: re-inserts the saved snapshot, marks the
    /// record restored, and logs an INSERT audit event.
    pub fn restore(&self, deleted_id: i64, batch_size: usize) -> Result<DeletedRecord, SyncError> {
        let rows = self.store.query_rows(
            "SELECT id, table_name, row_guid, row_name, row_data, company, session_id, \
                    deleted_at, is_restored \
             FROM deleted_records WHERE id = ?1 AND is_restored = 0",
            vec![SqlValue::Integer(deleted_id)],
        )?;
        let record = rows
            .first()
            .map(deleted_record_from_row)
            .ok_or_else(|| {
                SyncError::StoreWrite(format!(
                    "deleted record {deleted_id} not found or already restored"
                ))
            })?;

        let snapshot = match &record.row_data {
            Value::Object(map) => map.clone(),
            _ => {
                return Err(SyncError::StoreWrite(format!(
                    "deleted record {deleted_id} has an unreadable snapshot"
                )))
            }
        };

        self.store
            .upsert(&record.table, &[snapshot.clone()], &record.company, batch_size)?;
        self.store.execute(
            "UPDATE deleted_records SET is_restored = 1 WHERE id = ?1",
            vec![SqlValue::Integer(deleted_id)],
        )?;
        self.log_insert(
            &record.table,
            &record.row_guid,
            &record.row_name,
            &snapshot,
            None,
        );
        info!(
            table = record.table.as_str(),
            guid = record.row_guid.as_str(),
            "restored deleted record"
        );
        Ok(record)
    }
}

/// Column equality for diffing. The store hands integers back for INTEGER
/// columns while the decoder produces floats, so numbers compare by value.
fn values_equal(old_value: &Value, new_value: &Value) -> bool {
    match (old_value, new_value) {
        (Value::Number(old), Value::Number(new)) => old.as_f64() == new.as_f64(),
        _ => old_value == new_value,
    }
}

fn snapshot_value(row: Option<&Row>) -> SqlValue {
    match row {
        Some(map) => SqlValue::Text(Value::Object(map.clone()).to_string()),
        None => SqlValue::Null,
    }
}

fn parse_json_column(row: &Row, key: &str) -> Option<Value> {
    match row.get(key) {
        Some(Value::String(raw)) if !raw.is_empty() => serde_json::from_str(raw).ok(),
        _ => None,
    }
}

fn audit_record_from_row(row: &Row) -> AuditEventRecord {
    AuditEventRecord {
        id: row.get("id").and_then(Value::as_i64).unwrap_or(0),
        session_id: row_text(row, "session_id").to_string(),
        sync_kind: row_text(row, "sync_kind").to_string(),
        table: row_text(row, "table_name").to_string(),
        row_guid: row_text(row, "row_guid").to_string(),
        row_name: row_text(row, "row_name").to_string(),
        action: row_text(row, "action").to_string(),
        before: parse_json_column(row, "before_data"),
        after: parse_json_column(row, "after_data"),
        changed_columns: parse_json_column(row, "changed_columns").and_then(|value| {
            serde_json::from_value::<Vec<String>>(value).ok()
        }),
        company: row_text(row, "company").to_string(),
        gateway_alter_id: row.get("gateway_alter_id").and_then(Value::as_i64),
        created_at: row_text(row, "created_at").to_string(),
    }
}

fn deleted_record_from_row(row: &Row) -> DeletedRecord {
    DeletedRecord {
        id: row.get("id").and_then(Value::as_i64).unwrap_or(0),
        table: row_text(row, "table_name").to_string(),
        row_guid: row_text(row, "row_guid").to_string(),
        row_name: row_text(row, "row_name").to_string(),
        row_data: parse_json_column(row, "row_data").unwrap_or(Value::Null),
        company: row_text(row, "company").to_string(),
        session_id: row_text(row, "session_id").to_string(),
        deleted_at: row_text(row, "deleted_at").to_string(),
        is_restored: row.get("is_restored").and_then(Value::as_i64).unwrap_or(0) != 0,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::schema;

    use super::*;

    fn recorder() -> (Arc<Store>, AuditRecorder) {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        store
            .bootstrap(schema::DEFAULT_SCHEMA, &["mst_ledger".to_string()])
            .expect("bootstrap");
        let recorder = AuditRecorder::new(Arc::clone(&store));
        recorder.start_session("incremental_20250101_abcd1234", "incremental", "ACME");
        (store, recorder)
    }

    fn ledger_row(guid: &str, name: &str, balance: f64) -> Row {
        let mut row = Row::new();
        row.insert("guid".to_string(), json!(guid));
        row.insert("name".to_string(), json!(name));
        row.insert("alterid".to_string(), json!(1));
        row.insert("opening_balance".to_string(), json!(balance));
        row
    }

    #[test]
    fn insert_events_have_after_but_no_before() {
        let (_store, recorder) = recorder();
        recorder.log_insert("mst_ledger", "l-1", "Cash", &ledger_row("l-1", "Cash", 10.0), Some(5));

        let events = recorder.history(&AuditFilter::default()).expect("history");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.action, ACTION_INSERT);
        assert!(event.before.is_none());
        assert!(event.after.is_some());
        assert_eq!(event.company, "ACME");
        assert_eq!(event.gateway_alter_id, Some(5));
        assert_eq!(event.session_id, "incremental_20250101_abcd1234");
    }

    #[test]
    fn update_events_report_changed_columns_only() {
        let (_store, recorder) = recorder();
        let before = ledger_row("l-1", "Cash", 10.0);
        let after = ledger_row("l-1", "Cash In Hand", 10.0);
        recorder.log_update("mst_ledger", "l-1", "Cash", &before, &after, Some(6));

        let events = recorder.history(&AuditFilter::default()).expect("history");
        assert_eq!(events.len(), 1);
        let changed = events[0].changed_columns.clone().expect("changed columns");
        assert_eq!(changed, vec!["name".to_string()]);
        // Every reported column really differs.
        let before_snapshot = events[0].before.clone().expect("before");
        let after_snapshot = events[0].after.clone().expect("after");
        for column in &changed {
            assert_ne!(before_snapshot[column], after_snapshot[column]);
        }
    }

    #[test]
    fn no_op_updates_are_not_recorded() {
        let (_store, recorder) = recorder();
        let row = ledger_row("l-1", "Cash", 10.0);
        recorder.log_update("mst_ledger", "l-1", "Cash", &row, &row.clone(), None);
        assert!(recorder.history(&AuditFilter::default()).expect("history").is_empty());
    }

    #[test]
    fn integer_and_float_renderings_of_one_number_are_not_a_change() {
        let (_store, recorder) = recorder();
        let before = ledger_row("l-1", "Cash", 10.0);
        let mut after = ledger_row("l-1", "Cash", 10.0);
        after.insert("alterid".to_string(), json!(1.0));
        recorder.log_update("mst_ledger", "l-1", "Cash", &before, &after, None);
        assert!(recorder.history(&AuditFilter::default()).expect("history").is_empty());
    }

    #[test]
    fn delete_events_store_a_restorable_snapshot() {
        let (_store, recorder) = recorder();
        recorder.log_delete("mst_ledger", "l-2", "Rent", &ledger_row("l-2", "Rent", -4.0));

        let events = recorder.history(&AuditFilter::default()).expect("history");
        assert_eq!(events[0].action, ACTION_DELETE);
        assert!(events[0].after.is_none());

        let deleted = recorder
            .deleted_records(None, None, false, 10, 0)
            .expect("deleted");
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].row_guid, "l-2");
        assert_eq!(deleted[0].session_id, events[0].session_id);
        assert!(!deleted[0].is_restored);
    }

    #[test]
    fn restore_reinserts_snapshot_and_marks_restored() {
        let (store, recorder) = recorder();
        let snapshot = ledger_row("l-2", "Rent", -4.0);
        recorder.log_delete("mst_ledger", "l-2", "Rent", &snapshot);
        let deleted = recorder
            .deleted_records(None, None, false, 10, 0)
            .expect("deleted");

        let restored = recorder.restore(deleted[0].id, 100).expect("restore");
        assert_eq!(restored.row_guid, "l-2");

        let row = store
            .fetch_row("mst_ledger", "l-2", "ACME")
            .expect("fetch")
            .expect("row restored");
        assert_eq!(row["name"], json!("Rent"));
        assert_eq!(row["opening_balance"], json!(-4.0));

        // Marked restored, and restoring twice fails.
        assert!(recorder
            .deleted_records(None, None, false, 10, 0)
            .expect("deleted")
            .is_empty());
        assert!(recorder.restore(deleted[0].id, 100).is_err());

        // The restoration itself is auditable as an INSERT.
        let events = recorder.history(&AuditFilter::default()).expect("history");
        assert!(events.iter().any(|event| event.action == ACTION_INSERT));
    }

    #[test]
    fn history_filters_compose() {
        let (_store, recorder) = recorder();
        recorder.log_insert("mst_ledger", "l-1", "Cash", &ledger_row("l-1", "Cash", 1.0), None);
        recorder.log_delete("mst_ledger", "l-2", "Rent", &ledger_row("l-2", "Rent", 2.0));

        let deletes = recorder
            .history(&AuditFilter {
                action: Some("delete".to_string()),
                ..AuditFilter::default()
            })
            .expect("history");
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].row_guid, "l-2");

        let for_record = recorder.record_history("mst_ledger", "l-1").expect("record");
        assert_eq!(for_record.len(), 1);

        let none = recorder
            .history(&AuditFilter {
                company: Some("BETA".to_string()),
                ..AuditFilter::default()
            })
            .expect("history");
        assert!(none.is_empty());
    }

    #[test]
    fn session_changes_summarise_by_action() {
        let (_store, recorder) = recorder();
        recorder.log_insert("mst_ledger", "l-1", "Cash", &ledger_row("l-1", "Cash", 1.0), None);
        recorder.log_insert("mst_ledger", "l-3", "Bank", &ledger_row("l-3", "Bank", 3.0), None);
        recorder.log_delete("mst_ledger", "l-2", "Rent", &ledger_row("l-2", "Rent", 2.0));

        let changes = recorder
            .session_changes("incremental_20250101_abcd1234")
            .expect("changes");
        assert_eq!(changes.total_changes, 3);
        assert_eq!(changes.summary[ACTION_INSERT], 2);
        assert_eq!(changes.summary[ACTION_DELETE], 1);
    }

    #[test]
    fn stats_count_pending_deletions() {
        let (_store, recorder) = recorder();
        recorder.log_insert("mst_ledger", "l-1", "Cash", &ledger_row("l-1", "Cash", 1.0), None);
        recorder.log_delete("mst_ledger", "l-2", "Rent", &ledger_row("l-2", "Rent", 2.0));

        let stats = recorder.stats(Some("ACME")).expect("stats");
        assert_eq!(stats.by_action[ACTION_INSERT], 1);
        assert_eq!(stats.by_action[ACTION_DELETE], 1);
        assert_eq!(stats.by_table["mst_ledger"], 2);
        assert_eq!(stats.pending_deleted_records, 1);
    }

    #[test]
    fn audit_failures_are_swallowed() {
        let (store, recorder) = recorder();
        // Simulate audit storage loss mid-sync; the recorder must not panic
        // or error, and unrelated store writes must keep working.
        store
            .execute("DROP TABLE audit_log", Vec::new())
            .expect("drop");
        recorder.log_insert("mst_ledger", "l-1", "Cash", &ledger_row("l-1", "Cash", 1.0), None);

        store
            .bulk_insert("mst_ledger", &[ledger_row("l-9", "Misc", 0.0)], "ACME", 100)
            .expect("sync writes unaffected");
        assert!(store
            .fetch_row("mst_ledger", "l-9", "ACME")
            .expect("fetch")
            .is_some());
    }
}
