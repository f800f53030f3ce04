use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::info;

/// Embedded fallback applied when no external schema file is configured.
pub const DEFAULT_SCHEMA: &str = include_str!("../sql/default_schema.sql");

/// Loads the declarative schema file, falling back to the embedded default
/// so a fresh checkout bootstraps without any data files on disk.
pub fn load_schema(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            info!(path = %path.display(), "loading store schema from file");
            raw
        }
        Err(_) => DEFAULT_SCHEMA.to_string(),
    }
}

struct Rewrites {
    create_table: Regex,
    create_index: Regex,
    nvarchar: Regex,
    varchar: Regex,
    tinyint: Regex,
    decimal: Regex,
    int: Regex,
    date: Regex,
}

fn rewrites() -> &'static Rewrites {
    static RULES: OnceLock<Rewrites> = OnceLock::new();
    RULES.get_or_init(|| Rewrites {
        create_table: Regex::new(r"(?i)\bcreate\s+table\s+(if\s+not\s+exists\s+)?")
            .expect("static pattern"),
        create_index: Regex::new(r"(?i)\bcreate\s+index\s+(if\s+not\s+exists\s+)?")
            .expect("static pattern"),
        nvarchar: Regex::new(r"(?i)\bnvarchar\s*\(\d+\)").expect("static pattern"),
        varchar: Regex::new(r"(?i)\bvarchar\s*\(\d+\)").expect("static pattern"),
        tinyint: Regex::new(r"(?i)\btinyint\b").expect("static pattern"),
        decimal: Regex::new(r"(?i)\bdecimal\s*\(\d+\s*,\s*\d+\)").expect("static pattern"),
        int: Regex::new(r"(?i)\bint\b").expect("static pattern"),
        // Only the `date` *type* position: preceded by whitespace and
        // followed by a separator or a column constraint, so columns that
        // happen to be named `date` survive.
        date: Regex::new(r"(?i)(\s)date(\s*,|\s*\n|\s*\r|\s+not\b|\s+default\b|\s*\))")
            .expect("static pattern"),
    })
}

/// Rewrites vendor-dialect DDL into SQLite's supported set and makes every
/// CREATE idempotent. Applied to the whole schema text before execution.
pub fn rewrite_for_sqlite(sql: &str) -> String {
    let rules = rewrites();
    let sql = rules
        .create_table
        .replace_all(sql, "CREATE TABLE IF NOT EXISTS ");
    let sql = rules
        .create_index
        .replace_all(&sql, "CREATE INDEX IF NOT EXISTS ");
    let sql = rules.nvarchar.replace_all(&sql, "TEXT");
    let sql = rules.varchar.replace_all(&sql, "TEXT");
    let sql = rules.tinyint.replace_all(&sql, "INTEGER");
    let sql = rules.decimal.replace_all(&sql, "REAL");
    let sql = rules.int.replace_all(&sql, "INTEGER");
    let sql = rules.date.replace_all(&sql, "${1}TEXT${2}");
    sql.into_owned()
}

/// Splits a schema document into executable statements.
pub fn statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .map(str::to_string)
        .collect()
}
