//! Embedded SQLite store and audit trail for the replication engine.
//!
//! One write connection in WAL mode carries every mutation: schema bootstrap
//! with vendor-type rewriting, company-scoped truncate/insert/upsert, the
//! incremental diff staging tables, company bookkeeping, sync history, and
//! the best-effort audit recorder with restorable deletions.

pub mod audit;
pub mod schema;
pub mod store;

pub use audit::{
    AuditEventRecord, AuditFilter, AuditRecorder, AuditStats, DeletedRecord, SessionChanges,
    ACTION_DELETE, ACTION_INSERT, ACTION_UPDATE,
};
pub use schema::{load_schema, rewrite_for_sqlite, DEFAULT_SCHEMA};
pub use store::{
    CompanyState, CompanyStateUpdate, HistoryRecord, Store, ALTER_ID_COLUMN, COMPANY_COLUMN,
    GUID_COLUMN,
};
