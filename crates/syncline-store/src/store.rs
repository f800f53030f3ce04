use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use syncline_core::config::StoreConfig;
use syncline_core::error::SyncError;
use syncline_core::spec::CascadeTarget;
use syncline_core::time_utils::now_iso;
use syncline_core::value::Row;
use tracing::{debug, info};

use crate::schema;

/// Column stamped on every replicated row to partition companies.
pub const COMPANY_COLUMN: &str = "_company";
/// Stable row identity column on Primary tables.
pub const GUID_COLUMN: &str = "guid";
/// Revision column compared during incremental diffing.
pub const ALTER_ID_COLUMN: &str = "alterid";

/// Replicated per-company sync bookkeeping, one row per company.
#[derive(Debug, Clone, Serialize)]
pub struct CompanyState {
    pub name: String,
    pub guid: String,
    pub alter_id: i64,
    pub last_alter_id_master: i64,
    pub last_alter_id_transaction: i64,
    pub last_sync_at: Option<String>,
    pub last_sync_kind: Option<String>,
    pub sync_count: i64,
}

/// Fields written back to [`CompanyState`] at the end of a sync.
#[derive(Debug, Clone, Default)]
pub struct CompanyStateUpdate {
    pub guid: String,
    pub alter_id: i64,
    pub last_alter_id_master: i64,
    pub last_alter_id_transaction: i64,
    pub sync_kind: String,
}

/// One `sync_history` record.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub session_id: String,
    pub kind: String,
    pub company: String,
    pub status: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub rows_processed: i64,
    pub duration_seconds: i64,
    pub error: Option<String>,
}

fn db_err(err: rusqlite::Error) -> SyncError {
    SyncError::StoreWrite(err.to_string())
}

/// Identifiers come from the trusted spec files, never from gateway data,
/// but they still get quoted and checked before interpolation.
fn quote_ident(name: &str) -> Result<String, SyncError> {
    if name.is_empty() || name.contains('"') {
        return Err(SyncError::StoreWrite(format!(
            "invalid identifier '{name}'"
        )));
    }
    Ok(format!("\"{name}\""))
}

fn bind_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                SqlValue::Integer(int)
            } else {
                SqlValue::Real(number.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn column_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    match value {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(int) => Value::from(int),
        rusqlite::types::ValueRef::Real(real) => Value::from(real),
        rusqlite::types::ValueRef::Text(text) => {
            Value::String(String::from_utf8_lossy(text).into_owned())
        }
        rusqlite::types::ValueRef::Blob(blob) => {
            Value::String(String::from_utf8_lossy(blob).into_owned())
        }
    }
}

/// Embedded store wrapper: one write connection in WAL mode, all writes
/// serialise on it. Reads from other components share the same handle; the
/// busy timeout keeps pollers from starving the sync writer.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the store file and applies the pragmas.
    pub fn open(config: &StoreConfig) -> Result<Self, SyncError> {
        let path = PathBuf::from(&config.path);
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| SyncError::StoreWrite(format!("failed to create {}: {err}", parent.display())))?;
        }
        let conn = Connection::open(&path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.pragma_update(None, "busy_timeout", config.busy_timeout_ms as i64)
            .map_err(db_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(db_err)?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies the declarative schema (rewritten for SQLite), creates the
    /// service tables, and makes sure every replicated table carries the
    /// company column. Idempotent; runs at every startup and sync preamble.
    pub fn bootstrap(&self, schema_sql: &str, replicated_tables: &[String]) -> Result<(), SyncError> {
        let rewritten = schema::rewrite_for_sqlite(schema_sql);
        {
            let conn = self.lock();
            for statement in schema::statements(&rewritten) {
                conn.execute_batch(&statement).map_err(|err| {
                    SyncError::StoreWrite(format!("schema statement failed: {err}"))
                })?;
            }
            conn.execute_batch(SERVICE_TABLES).map_err(db_err)?;
        }
        for table in replicated_tables {
            self.ensure_company_column(table)?;
        }
        debug!("store bootstrap complete");
        Ok(())
    }

    fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, SyncError> {
        let mut statement = conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)?))
            .map_err(db_err)?;
        let columns = statement
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(columns)
    }

    /// True when `table` exists in the store.
    pub fn table_exists(&self, table: &str) -> Result<bool, SyncError> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    fn ensure_company_column(&self, table: &str) -> Result<(), SyncError> {
        let conn = self.lock();
        let columns = Self::table_columns(&conn, table)?;
        if columns.is_empty() {
            // Table not declared by the schema file; it will be created on
            // first insert if a spec produces rows for it.
            return Ok(());
        }
        if !columns.iter().any(|column| column == COMPANY_COLUMN) {
            conn.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {} TEXT DEFAULT ''",
                    quote_ident(table)?,
                    COMPANY_COLUMN
                ),
                [],
            )
            .map_err(db_err)?;
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS \"idx_{table}_company\" ON {} ({})",
                    quote_ident(table)?,
                    COMPANY_COLUMN
                ),
                [],
            )
            .map_err(db_err)?;
            debug!(table, "added company column");
        }
        Ok(())
    }

    fn ensure_columns(&self, table: &str, columns: &[String]) -> Result<(), SyncError> {
        let conn = self.lock();
        let existing = Self::table_columns(&conn, table)?;
        if existing.is_empty() {
            // A spec can name a table the schema file does not declare; it
            // materialises on first insert, keyed by guid when one exists.
            let defs: Vec<String> = columns
                .iter()
                .map(|column| {
                    let quoted = quote_ident(column)?;
                    if column == GUID_COLUMN {
                        Ok(format!("{quoted} TEXT PRIMARY KEY"))
                    } else {
                        Ok(format!("{quoted} TEXT DEFAULT ''"))
                    }
                })
                .collect::<Result<_, SyncError>>()?;
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    quote_ident(table)?,
                    defs.join(", ")
                ),
                [],
            )
            .map_err(db_err)?;
            info!(table, "created undeclared table on first insert");
            return Ok(());
        }
        for column in columns {
            if !existing.iter().any(|name| name == column) {
                conn.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {} TEXT DEFAULT ''",
                        quote_ident(table)?,
                        quote_ident(column)?
                    ),
                    [],
                )
                .map_err(db_err)?;
                debug!(table, column = column.as_str(), "auto-added column");
            }
        }
        Ok(())
    }

    /// Deletes rows for one company when the table is partitioned, or
    /// everything when it is not.
    pub fn truncate(&self, table: &str, company: &str) -> Result<usize, SyncError> {
        let has_company = {
            let conn = self.lock();
            Self::table_columns(&conn, table)?
                .iter()
                .any(|column| column == COMPANY_COLUMN)
        };
        let conn = self.lock();
        let affected = if has_company && !company.is_empty() {
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    quote_ident(table)?,
                    COMPANY_COLUMN
                ),
                params![company],
            )
            .map_err(db_err)?
        } else {
            conn.execute(&format!("DELETE FROM {}", quote_ident(table)?), [])
                .map_err(db_err)?
        };
        debug!(table, company, affected, "truncated");
        Ok(affected)
    }

    fn write_rows(
        &self,
        table: &str,
        rows: &[Row],
        company: &str,
        replace: bool,
        batch_size: usize,
    ) -> Result<usize, SyncError> {
        if rows.is_empty() {
            return Ok(0);
        }

        // Column list comes from the first row; every decoded row of one
        // table shares the same shape, plus the company stamp.
        let mut columns: Vec<String> = rows[0].keys().cloned().collect();
        if !columns.iter().any(|column| column == COMPANY_COLUMN) {
            columns.push(COMPANY_COLUMN.to_string());
        }
        self.ensure_columns(table, &columns)?;

        let quoted: Vec<String> = columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Result<_, _>>()?;
        let placeholders: Vec<String> = (1..=columns.len()).map(|index| format!("?{index}")).collect();
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
        let sql = format!(
            "{verb} INTO {} ({}) VALUES ({})",
            quote_ident(table)?,
            quoted.join(", "),
            placeholders.join(", ")
        );

        let mut conn = self.lock();
        let mut written = 0_usize;
        for batch in rows.chunks(batch_size.max(1)) {
            let tx = conn.transaction().map_err(db_err)?;
            {
                let mut statement = tx.prepare(&sql).map_err(db_err)?;
                for row in batch {
                    let values: Vec<SqlValue> = columns
                        .iter()
                        .map(|column| {
                            if column == COMPANY_COLUMN {
                                row.get(COMPANY_COLUMN)
                                    .map(bind_value)
                                    .unwrap_or_else(|| SqlValue::Text(company.to_string()))
                            } else {
                                row.get(column).map(bind_value).unwrap_or(SqlValue::Null)
                            }
                        })
                        .collect();
                    statement
                        .execute(rusqlite::params_from_iter(values))
                        .map_err(db_err)?;
                    written += 1;
                }
            }
            tx.commit().map_err(db_err)?;
        }
        Ok(written)
    }

    /// Inserts rows stamped with `company`, one commit per batch. Unknown
    /// columns extend the table with a text default before the first batch.
    pub fn bulk_insert(
        &self,
        table: &str,
        rows: &[Row],
        company: &str,
        batch_size: usize,
    ) -> Result<usize, SyncError> {
        self.write_rows(table, rows, company, false, batch_size)
    }

    /// INSERT-or-REPLACE on the table's primary key (the GUID for Primary
    /// tables). Secondary tables are never upserted individually; cascade
    /// purges handle them.
    pub fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        company: &str,
        batch_size: usize,
    ) -> Result<usize, SyncError> {
        self.write_rows(table, rows, company, true, batch_size)
    }

    /// Replaces the contents of the `_diff` staging table with the given
    /// (guid, alterid) pairs.
    pub fn stage_diff(&self, rows: &[Row]) -> Result<usize, SyncError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM _diff", []).map_err(db_err)?;
        let mut staged = 0_usize;
        {
            let mut statement = tx
                .prepare("INSERT OR REPLACE INTO _diff (guid, alterid) VALUES (?1, ?2)")
                .map_err(db_err)?;
            for row in rows {
                let guid = row.get(GUID_COLUMN).map(bind_value).unwrap_or(SqlValue::Null);
                if matches!(guid, SqlValue::Null) {
                    continue;
                }
                let alter_id = row
                    .get(ALTER_ID_COLUMN)
                    .map(bind_value)
                    .unwrap_or(SqlValue::Integer(0));
                statement
                    .execute(rusqlite::params_from_iter([guid, alter_id]))
                    .map_err(db_err)?;
                staged += 1;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(staged)
    }

    /// Populates `_delete` with the company's rows that are (a) absent from
    /// `_diff` or (b) present with a different alter-id. Returns the number
    /// of staged guids.
    pub fn stage_deletions_for(&self, table: &str, company: &str) -> Result<usize, SyncError> {
        let table_ident = quote_ident(table)?;
        let conn = self.lock();
        conn.execute("DELETE FROM _delete", []).map_err(db_err)?;
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO _delete (guid) \
                 SELECT t.{guid} FROM {table_ident} t \
                 WHERE t.{company_col} = ?1 \
                   AND t.{guid} NOT IN (SELECT guid FROM _diff)",
                guid = GUID_COLUMN,
                company_col = COMPANY_COLUMN,
            ),
            params![company],
        )
        .map_err(db_err)?;
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO _delete (guid) \
                 SELECT t.{guid} FROM {table_ident} t \
                 JOIN _diff d ON d.guid = t.{guid} \
                 WHERE t.{company_col} = ?1 AND t.{alter} <> d.alterid",
                guid = GUID_COLUMN,
                company_col = COMPANY_COLUMN,
                alter = ALTER_ID_COLUMN,
            ),
            params![company],
        )
        .map_err(db_err)?;
        let staged: i64 = conn
            .query_row("SELECT COUNT(*) FROM _delete", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(staged as usize)
    }

    /// Guids currently staged for deletion.
    pub fn deletion_candidates(&self) -> Result<Vec<String>, SyncError> {
        let conn = self.lock();
        let mut statement = conn
            .prepare("SELECT guid FROM _delete ORDER BY guid")
            .map_err(db_err)?;
        let guids = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(guids)
    }

    /// Purges cascade children then the staged parent rows, company-scoped,
    /// as one atomic unit.
    pub fn cascade_and_delete(
        &self,
        table: &str,
        cascades: &[CascadeTarget],
        company: &str,
    ) -> Result<usize, SyncError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;
        for cascade in cascades {
            let child = quote_ident(&cascade.table)?;
            let fk = quote_ident(&cascade.column)?;
            tx.execute(
                &format!(
                    "DELETE FROM {child} WHERE {fk} IN (SELECT guid FROM _delete) AND {company_col} = ?1",
                    company_col = COMPANY_COLUMN,
                ),
                params![company],
            )
            .map_err(db_err)?;
        }
        let removed = tx
            .execute(
                &format!(
                    "DELETE FROM {} WHERE {} IN (SELECT guid FROM _delete) AND {} = ?1",
                    quote_ident(table)?,
                    GUID_COLUMN,
                    COMPANY_COLUMN,
                ),
                params![company],
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        debug!(table, company, removed, "cascade delete applied");
        Ok(removed)
    }

    /// Fetches one row by (guid, company), all columns as JSON values.
    pub fn fetch_row(
        &self,
        table: &str,
        guid: &str,
        company: &str,
    ) -> Result<Option<Row>, SyncError> {
        let conn = self.lock();
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1 AND {} = ?2",
            quote_ident(table)?,
            GUID_COLUMN,
            COMPANY_COLUMN,
        );
        let mut statement = conn.prepare(&sql).map_err(db_err)?;
        let column_names: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let row = statement
            .query_row(params![guid, company], |row| {
                let mut map = Row::new();
                for (index, name) in column_names.iter().enumerate() {
                    map.insert(name.clone(), column_to_json(row.get_ref(index)?));
                }
                Ok(map)
            })
            .optional()
            .map_err(db_err)?;
        Ok(row)
    }

    /// Row counts per table; scoped to one company when given.
    pub fn table_counts(
        &self,
        tables: &[String],
        company: Option<&str>,
    ) -> Result<BTreeMap<String, i64>, SyncError> {
        let mut counts = BTreeMap::new();
        for table in tables {
            if !self.table_exists(table)? {
                counts.insert(table.clone(), 0);
                continue;
            }
            let has_company = {
                let conn = self.lock();
                Self::table_columns(&conn, table)?
                    .iter()
                    .any(|column| column == COMPANY_COLUMN)
            };
            let conn = self.lock();
            let count: i64 = match company.filter(|_| has_company) {
                Some(name) => conn
                    .query_row(
                        &format!(
                            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
                            quote_ident(table)?,
                            COMPANY_COLUMN
                        ),
                        params![name],
                        |row| row.get(0),
                    )
                    .map_err(db_err)?,
                None => conn
                    .query_row(
                        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)?),
                        [],
                        |row| row.get(0),
                    )
                    .map_err(db_err)?,
            };
            counts.insert(table.clone(), count);
        }
        Ok(counts)
    }

    /// Store file size in bytes; zero for in-memory stores.
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path)
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn company_state_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CompanyState> {
        Ok(CompanyState {
            name: row.get(0)?,
            guid: row.get(1)?,
            alter_id: row.get(2)?,
            last_alter_id_master: row.get(3)?,
            last_alter_id_transaction: row.get(4)?,
            last_sync_at: row.get(5)?,
            last_sync_kind: row.get(6)?,
            sync_count: row.get(7)?,
        })
    }

    const COMPANY_STATE_COLUMNS: &'static str = "company_name, company_guid, company_alterid, \
        last_alter_id_master, last_alter_id_transaction, last_sync_at, last_sync_kind, sync_count";

    /// Sync bookkeeping for one company, if it has ever synced.
    pub fn company_state(&self, name: &str) -> Result<Option<CompanyState>, SyncError> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM company_config WHERE company_name = ?1",
                Self::COMPANY_STATE_COLUMNS
            ),
            params![name],
            Self::company_state_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Transactional upsert of the company record keyed by name. An empty
    /// guid or zero alter-id in the update keeps the stored value; the sync
    /// counter always advances.
    pub fn upsert_company_state(
        &self,
        name: &str,
        update: &CompanyStateUpdate,
    ) -> Result<(), SyncError> {
        let now = now_iso();
        let conn = self.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT sync_count FROM company_config WHERE company_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match existing {
            Some(sync_count) => {
                conn.execute(
                    "UPDATE company_config SET \
                         company_guid = CASE WHEN ?2 = '' THEN company_guid ELSE ?2 END, \
                         company_alterid = CASE WHEN ?3 > 0 THEN ?3 ELSE company_alterid END, \
                         last_alter_id_master = ?4, \
                         last_alter_id_transaction = ?5, \
                         last_sync_at = ?6, \
                         last_sync_kind = ?7, \
                         sync_count = ?8, \
                         updated_at = ?6 \
                     WHERE company_name = ?1",
                    params![
                        name,
                        update.guid,
                        update.alter_id,
                        update.last_alter_id_master,
                        update.last_alter_id_transaction,
                        now,
                        update.sync_kind,
                        sync_count + 1,
                    ],
                )
                .map_err(db_err)?;
            }
            None => {
                conn.execute(
                    "INSERT INTO company_config \
                         (company_name, company_guid, company_alterid, last_alter_id_master, \
                          last_alter_id_transaction, last_sync_at, last_sync_kind, sync_count, \
                          created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?6, ?6)",
                    params![
                        name,
                        update.guid,
                        update.alter_id,
                        update.last_alter_id_master,
                        update.last_alter_id_transaction,
                        now,
                        update.sync_kind,
                    ],
                )
                .map_err(db_err)?;
                info!(company = name, "registered new company");
            }
        }
        Ok(())
    }

    /// Advances the alter-id watermarks without touching the sync counter.
    /// Used at the end of a successful sync; the watermarks are the values
    /// observed at the sync's start.
    pub fn update_company_alter_ids(
        &self,
        name: &str,
        master: i64,
        transaction: i64,
    ) -> Result<(), SyncError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE company_config SET last_alter_id_master = ?2, \
                 last_alter_id_transaction = ?3, updated_at = ?4 \
             WHERE company_name = ?1",
            params![name, master, transaction, now_iso()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Every company with sync bookkeeping, ordered by name.
    pub fn synced_companies(&self) -> Result<Vec<CompanyState>, SyncError> {
        let conn = self.lock();
        let mut statement = conn
            .prepare(&format!(
                "SELECT {} FROM company_config ORDER BY company_name",
                Self::COMPANY_STATE_COLUMNS
            ))
            .map_err(db_err)?;
        let companies = statement
            .query_map([], Self::company_state_from_row)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(companies)
    }

    /// Records a starting session in `sync_history`; returns the row id.
    pub fn insert_history(
        &self,
        session_id: &str,
        kind: &str,
        company: &str,
        started_at: &str,
    ) -> Result<i64, SyncError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sync_history (session_id, kind, company, status, started_at, rows_processed) \
             VALUES (?1, ?2, ?3, 'running', ?4, 0)",
            params![session_id, kind, company, started_at],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Terminal update of a `sync_history` record.
    pub fn update_history(
        &self,
        history_id: i64,
        status: &str,
        rows_processed: u64,
        duration_seconds: i64,
        error: Option<&str>,
    ) -> Result<(), SyncError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sync_history SET status = ?2, ended_at = ?3, rows_processed = ?4, \
                 duration_seconds = ?5, error = ?6 WHERE id = ?1",
            params![
                history_id,
                status,
                now_iso(),
                rows_processed as i64,
                duration_seconds,
                error,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Latest sync sessions, newest first.
    pub fn list_history(&self, limit: usize) -> Result<Vec<HistoryRecord>, SyncError> {
        let conn = self.lock();
        let mut statement = conn
            .prepare(
                "SELECT id, session_id, kind, company, status, started_at, ended_at, \
                        rows_processed, duration_seconds, error \
                 FROM sync_history ORDER BY started_at DESC, id DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let records = statement
            .query_map(params![limit as i64], |row| {
                Ok(HistoryRecord {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    kind: row.get(2)?,
                    company: row.get(3)?,
                    status: row.get(4)?,
                    started_at: row.get(5)?,
                    ended_at: row.get(6)?,
                    rows_processed: row.get(7)?,
                    duration_seconds: row.get(8)?,
                    error: row.get(9)?,
                })
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(records)
    }

    pub(crate) fn execute(&self, sql: &str, values: Vec<SqlValue>) -> Result<usize, SyncError> {
        let conn = self.lock();
        conn.execute(sql, rusqlite::params_from_iter(values))
            .map_err(db_err)
    }

    pub(crate) fn query_rows(
        &self,
        sql: &str,
        values: Vec<SqlValue>,
    ) -> Result<Vec<Row>, SyncError> {
        let conn = self.lock();
        let mut statement = conn.prepare(sql).map_err(db_err)?;
        let column_names: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let rows = statement
            .query_map(rusqlite::params_from_iter(values), |row| {
                let mut map = Row::new();
                for (index, name) in column_names.iter().enumerate() {
                    map.insert(name.clone(), column_to_json(row.get_ref(index)?));
                }
                Ok(map)
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }
}

/// Service tables the engine itself needs: company bookkeeping, diff
/// scratch space, the audit trail, and sync history.
const SERVICE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS company_config (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    company_name TEXT NOT NULL UNIQUE,
    company_guid TEXT NOT NULL DEFAULT '',
    company_alterid INTEGER NOT NULL DEFAULT 0,
    last_alter_id_master INTEGER NOT NULL DEFAULT 0,
    last_alter_id_transaction INTEGER NOT NULL DEFAULT 0,
    last_sync_at TEXT,
    last_sync_kind TEXT,
    sync_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_company_config_name ON company_config (company_name);

CREATE TABLE IF NOT EXISTS _diff (
    guid TEXT PRIMARY KEY,
    alterid NUMERIC NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS _delete (
    guid TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL DEFAULT '',
    sync_kind TEXT NOT NULL DEFAULT '',
    table_name TEXT NOT NULL,
    row_guid TEXT NOT NULL DEFAULT '',
    row_name TEXT NOT NULL DEFAULT '',
    action TEXT NOT NULL,
    before_data TEXT,
    after_data TEXT,
    changed_columns TEXT,
    company TEXT NOT NULL DEFAULT '',
    gateway_alter_id INTEGER,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_log_record ON audit_log (table_name, row_guid);
CREATE INDEX IF NOT EXISTS idx_audit_log_session ON audit_log (session_id);
CREATE INDEX IF NOT EXISTS idx_audit_log_company ON audit_log (company);

CREATE TABLE IF NOT EXISTS deleted_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    row_guid TEXT NOT NULL DEFAULT '',
    row_name TEXT NOT NULL DEFAULT '',
    row_data TEXT NOT NULL,
    company TEXT NOT NULL DEFAULT '',
    session_id TEXT NOT NULL DEFAULT '',
    deleted_at TEXT NOT NULL,
    is_restored INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_deleted_records_table ON deleted_records (table_name);

CREATE TABLE IF NOT EXISTS sync_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL,
    company TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    rows_processed INTEGER NOT NULL DEFAULT 0,
    duration_seconds INTEGER NOT NULL DEFAULT 0,
    error TEXT
);
";

#[cfg(test)]
mod tests {
    use serde_json::json;
    use syncline_core::spec::CascadeTarget;

    use super::*;

    fn test_store() -> Store {
        let store = Store::open_in_memory().expect("store");
        store
            .bootstrap(
                schema::DEFAULT_SCHEMA,
                &[
                    "mst_group".to_string(),
                    "mst_ledger".to_string(),
                    "trn_voucher".to_string(),
                    "trn_accounting".to_string(),
                ],
            )
            .expect("bootstrap");
        store
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        let mut row = Row::new();
        for (key, value) in pairs {
            row.insert((*key).to_string(), value.clone());
        }
        row
    }

    fn group_row(guid: &str, name: &str, alter_id: i64) -> Row {
        row(&[
            ("guid", json!(guid)),
            ("name", json!(name)),
            ("alterid", json!(alter_id)),
        ])
    }

    #[test]
    fn bootstrap_is_idempotent_and_adds_company_column() {
        let store = test_store();
        store
            .bootstrap(schema::DEFAULT_SCHEMA, &["mst_group".to_string()])
            .expect("second bootstrap");
        let conn = store.lock();
        let columns = Store::table_columns(&conn, "mst_group").expect("columns");
        assert!(columns.iter().any(|column| column == COMPANY_COLUMN));
    }

    #[test]
    fn truncate_scopes_to_company_when_column_exists() {
        let store = test_store();
        store
            .bulk_insert("mst_group", &[group_row("g-1", "Sales", 1)], "ACME", 100)
            .expect("insert acme");
        store
            .bulk_insert("mst_group", &[group_row("g-2", "Rent", 1)], "BETA", 100)
            .expect("insert beta");

        store.truncate("mst_group", "ACME").expect("truncate");
        let counts = store
            .table_counts(&["mst_group".to_string()], None)
            .expect("counts");
        assert_eq!(counts["mst_group"], 1);
        let beta = store
            .table_counts(&["mst_group".to_string()], Some("BETA"))
            .expect("counts");
        assert_eq!(beta["mst_group"], 1);
    }

    #[test]
    fn bulk_insert_stamps_company_and_extends_unknown_columns() {
        let store = test_store();
        let rows = vec![row(&[
            ("guid", json!("g-1")),
            ("name", json!("Sales")),
            ("alterid", json!(3)),
            ("brand_new_column", json!("hello")),
        ])];
        store
            .bulk_insert("mst_group", &rows, "ACME", 100)
            .expect("insert");

        let fetched = store
            .fetch_row("mst_group", "g-1", "ACME")
            .expect("fetch")
            .expect("row present");
        assert_eq!(fetched["brand_new_column"], json!("hello"));
        assert_eq!(fetched[COMPANY_COLUMN], json!("ACME"));
    }

    #[test]
    fn upsert_replaces_on_guid() {
        let store = test_store();
        store
            .bulk_insert("mst_group", &[group_row("g-1", "Sales", 1)], "ACME", 100)
            .expect("insert");
        store
            .upsert("mst_group", &[group_row("g-1", "Revenue", 2)], "ACME", 100)
            .expect("upsert");

        let counts = store
            .table_counts(&["mst_group".to_string()], Some("ACME"))
            .expect("counts");
        assert_eq!(counts["mst_group"], 1);
        let fetched = store
            .fetch_row("mst_group", "g-1", "ACME")
            .expect("fetch")
            .expect("row");
        assert_eq!(fetched["name"], json!("Revenue"));
        assert_eq!(fetched["alterid"], json!(2));
    }

    #[test]
    fn diff_staging_finds_absent_and_stale_guids() {
        let store = test_store();
        store
            .bulk_insert(
                "mst_group",
                &[
                    group_row("g-1", "Sales", 1),
                    group_row("g-2", "Rent", 1),
                    group_row("g-3", "Power", 1),
                ],
                "ACME",
                100,
            )
            .expect("insert");

        // Gateway now reports g-1 unchanged, g-2 modified, g-3 gone.
        store
            .stage_diff(&[
                row(&[("guid", json!("g-1")), ("alterid", json!(1))]),
                row(&[("guid", json!("g-2")), ("alterid", json!(5))]),
            ])
            .expect("stage diff");
        let staged = store
            .stage_deletions_for("mst_group", "ACME")
            .expect("stage deletions");
        assert_eq!(staged, 2);
        let candidates = store.deletion_candidates().expect("candidates");
        assert_eq!(candidates, vec!["g-2".to_string(), "g-3".to_string()]);
    }

    #[test]
    fn deletions_are_company_scoped() {
        let store = test_store();
        store
            .bulk_insert("mst_group", &[group_row("g-1", "Sales", 1)], "ACME", 100)
            .expect("acme");
        store
            .bulk_insert("mst_group", &[group_row("g-9", "Other", 1)], "BETA", 100)
            .expect("beta");

        store.stage_diff(&[]).expect("empty diff");
        let staged = store
            .stage_deletions_for("mst_group", "ACME")
            .expect("stage");
        assert_eq!(staged, 1, "only ACME rows are candidates");
        assert_eq!(store.deletion_candidates().expect("candidates"), vec!["g-1"]);
    }

    #[test]
    fn cascade_and_delete_purges_children_then_parents() {
        let store = test_store();
        store
            .bulk_insert(
                "trn_voucher",
                &[
                    row(&[("guid", json!("v-1")), ("alterid", json!(1)), ("date", json!("2025-04-01"))]),
                    row(&[("guid", json!("v-2")), ("alterid", json!(1)), ("date", json!("2025-04-02"))]),
                ],
                "ACME",
                100,
            )
            .expect("vouchers");
        store
            .bulk_insert(
                "trn_accounting",
                &[
                    row(&[("guid", json!("v-1")), ("ledger", json!("Cash")), ("amount", json!(10.0))]),
                    row(&[("guid", json!("v-1")), ("ledger", json!("Sales")), ("amount", json!(-10.0))]),
                    row(&[("guid", json!("v-2")), ("ledger", json!("Cash")), ("amount", json!(5.0))]),
                ],
                "ACME",
                100,
            )
            .expect("entries");

        store
            .stage_diff(&[row(&[("guid", json!("v-2")), ("alterid", json!(1))])])
            .expect("diff");
        store
            .stage_deletions_for("trn_voucher", "ACME")
            .expect("stage");
        let removed = store
            .cascade_and_delete(
                "trn_voucher",
                &[CascadeTarget {
                    table: "trn_accounting".to_string(),
                    column: "guid".to_string(),
                }],
                "ACME",
            )
            .expect("cascade");
        assert_eq!(removed, 1);

        let counts = store
            .table_counts(
                &["trn_voucher".to_string(), "trn_accounting".to_string()],
                Some("ACME"),
            )
            .expect("counts");
        assert_eq!(counts["trn_voucher"], 1);
        assert_eq!(counts["trn_accounting"], 1, "v-1 children purged with it");
    }

    #[test]
    fn company_state_upsert_advances_counter_and_keeps_guid() {
        let store = test_store();
        store
            .upsert_company_state(
                "ACME",
                &CompanyStateUpdate {
                    guid: "guid-acme".to_string(),
                    alter_id: 10,
                    last_alter_id_master: 10,
                    last_alter_id_transaction: 20,
                    sync_kind: "full".to_string(),
                },
            )
            .expect("first");
        store
            .upsert_company_state(
                "ACME",
                &CompanyStateUpdate {
                    guid: String::new(),
                    alter_id: 0,
                    last_alter_id_master: 12,
                    last_alter_id_transaction: 22,
                    sync_kind: "incremental".to_string(),
                },
            )
            .expect("second");

        let state = store
            .company_state("ACME")
            .expect("state")
            .expect("present");
        assert_eq!(state.sync_count, 2);
        assert_eq!(state.guid, "guid-acme", "empty guid keeps stored value");
        assert_eq!(state.alter_id, 10, "zero alter-id keeps stored value");
        assert_eq!(state.last_alter_id_master, 12);
        assert_eq!(state.last_alter_id_transaction, 22);
        assert_eq!(state.last_sync_kind.as_deref(), Some("incremental"));

        let companies = store.synced_companies().expect("companies");
        assert_eq!(companies.len(), 1);
    }

    #[test]
    fn history_lifecycle_round_trips() {
        let store = test_store();
        let id = store
            .insert_history("full_20250101_abcd1234", "full", "ACME", &now_iso())
            .expect("insert");
        store
            .update_history(id, "completed", 42, 3, None)
            .expect("update");
        let history = store.list_history(10).expect("list");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "completed");
        assert_eq!(history[0].rows_processed, 42);
        assert!(history[0].ended_at.is_some());
    }

    #[test]
    fn undeclared_tables_materialise_on_first_insert() {
        let store = test_store();
        let rows = vec![row(&[
            ("guid", json!("x-1")),
            ("payload", json!("hello")),
        ])];
        store
            .bulk_insert("mst_surprise", &rows, "ACME", 100)
            .expect("insert creates the table");
        assert!(store.table_exists("mst_surprise").expect("exists"));
        let fetched = store
            .fetch_row("mst_surprise", "x-1", "ACME")
            .expect("fetch")
            .expect("row");
        assert_eq!(fetched["payload"], json!("hello"));
    }

    #[test]
    fn batched_inserts_commit_every_batch() {
        let store = test_store();
        let rows: Vec<Row> = (0..25)
            .map(|index| group_row(&format!("g-{index}"), "n", 1))
            .collect();
        let written = store
            .bulk_insert("mst_group", &rows, "ACME", 10)
            .expect("insert");
        assert_eq!(written, 25);
        let counts = store
            .table_counts(&["mst_group".to_string()], Some("ACME"))
            .expect("counts");
        assert_eq!(counts["mst_group"], 25);
    }
}
