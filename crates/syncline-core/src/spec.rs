use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Whether a table owns gateway GUIDs or hangs off a parent row.
///
/// Primary tables participate in incremental diffing; Secondary tables are
/// child rows keyed by the parent GUID and are only ever removed by cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableNature {
    #[default]
    Primary,
    Secondary,
}

/// Field kinds drive both the expression template the report builder emits
/// and the coercion the response decoder applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Logical,
    Date,
    Number,
    Amount,
    Quantity,
    Rate,
}

impl FieldKind {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            FieldKind::Number | FieldKind::Amount | FieldKind::Quantity | FieldKind::Rate
        )
    }
}

/// One destination column: its name, the gateway expression that produces it,
/// and the kind governing template + coercion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "field")]
    pub expr: String,
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
}

/// Child table purged when a Primary row is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeTarget {
    pub table: String,
    pub column: String,
}

/// Declarative description of one replicated table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    /// Destination table name, stable across syncs.
    pub name: String,
    /// Dotted path through the gateway object graph, e.g.
    /// `Voucher.AllLedgerEntries`.
    pub collection: String,
    #[serde(default)]
    pub nature: TableNature,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub fetch: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub cascade_delete: Vec<CascadeTarget>,
}

impl TableSpec {
    /// Synthetic spec requesting only (guid, alterid) against the same
    /// collection and filters, used to stage the incremental diff.
    pub fn diff_probe(&self) -> TableSpec {
        TableSpec {
            name: self.name.clone(),
            collection: self.collection.clone(),
            nature: self.nature,
            fields: vec![
                FieldSpec {
                    name: "guid".to_string(),
                    expr: "Guid".to_string(),
                    kind: FieldKind::Text,
                },
                FieldSpec {
                    name: "alterid".to_string(),
                    expr: "AlterId".to_string(),
                    kind: FieldKind::Number,
                },
            ],
            fetch: Vec::new(),
            filters: self.filters.clone(),
            cascade_delete: Vec::new(),
        }
    }

    /// Copy of this spec with one extra gateway filter appended.
    pub fn with_filter(&self, filter: &str) -> TableSpec {
        let mut spec = self.clone();
        spec.filters.push(filter.to_string());
        spec
    }

    pub fn is_primary(&self) -> bool {
        self.nature == TableNature::Primary
    }
}

/// The full table-spec document: master tables first, then transactions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecSet {
    #[serde(default)]
    pub master: Vec<TableSpec>,
    #[serde(default)]
    pub transaction: Vec<TableSpec>,
}

impl SpecSet {
    /// All specs in sync order: masters in declaration order, then
    /// transactions in declaration order.
    pub fn all(&self) -> impl Iterator<Item = &TableSpec> {
        self.master.iter().chain(self.transaction.iter())
    }

    pub fn len(&self) -> usize {
        self.master.len() + self.transaction.len()
    }

    pub fn is_empty(&self) -> bool {
        self.master.is_empty() && self.transaction.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&TableSpec> {
        self.all().find(|spec| spec.name == name)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.is_empty() {
            return Err(SyncError::Config(
                "table-spec file declares no tables".to_string(),
            ));
        }
        for spec in self.all() {
            if spec.name.trim().is_empty() {
                return Err(SyncError::Config(
                    "table spec with an empty name".to_string(),
                ));
            }
            if spec.collection.trim().is_empty() {
                return Err(SyncError::Config(format!(
                    "table '{}' has no collection path",
                    spec.name
                )));
            }
            if spec.fields.is_empty() {
                return Err(SyncError::Config(format!(
                    "table '{}' declares no fields",
                    spec.name
                )));
            }
            for field in &spec.fields {
                if field.name.trim().is_empty() || field.expr.trim().is_empty() {
                    return Err(SyncError::Config(format!(
                        "table '{}' has a field with an empty name or expression",
                        spec.name
                    )));
                }
            }
            for cascade in &spec.cascade_delete {
                if cascade.table.trim().is_empty() || cascade.column.trim().is_empty() {
                    return Err(SyncError::Config(format!(
                        "table '{}' has a malformed cascade_delete entry",
                        spec.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Loads and validates the table-spec document. A missing or malformed file
/// is a `Config` error; the synchronizer refuses to start without specs.
pub fn load_table_specs(path: &Path) -> Result<SpecSet, SyncError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| SyncError::Config(format!("failed to read {}: {err}", path.display())))?;
    let specs: SpecSet = serde_yaml::from_str(&raw)
        .map_err(|err| SyncError::Config(format!("failed to parse {}: {err}", path.display())))?;
    specs.validate()?;
    Ok(specs)
}
