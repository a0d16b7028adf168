use chrono::{DateTime, Utc};
use gridbase_model::CellValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Roles understood by the authentication collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Editor,
    Exporter,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Exporter => "exporter",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity supplied by the authentication collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserRef {
    pub id: i64,
    pub role: Role,
}

/// Table metadata. `revision` is the single source of truth for optimistic
/// concurrency over the table's cells: it advances on every structural
/// change and every successful batch cell write, and never decreases.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub id: i64,
    pub name: String,
    pub revision: i64,
    pub metadata: Option<serde_json::Value>,
    pub export_roles: Vec<Role>,
}

/// A row within a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub table_id: i64,
    pub readonly: bool,
    pub metadata: Option<serde_json::Value>,
}

/// A record together with its cell values, keyed by field id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    #[serde(flatten)]
    pub record: Record,
    pub values: HashMap<i64, CellValue>,
}

/// Stored state of one (record, field) cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellSlot {
    pub value: CellValue,
    /// Only ever set when the owning field is a formula field.
    pub formula_expr: Option<String>,
    /// True between storing a formula expression and its recomputation.
    pub is_dirty: bool,
    pub computed_at: Option<DateTime<Utc>>,
}

/// One cell write within a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellWrite {
    pub record_id: i64,
    pub field_id: i64,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub formula_expr: Option<String>,
}

/// A write whose target cell no longer matches what the client attempted,
/// reported when a batch arrives with a stale revision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellConflict {
    pub record_id: i64,
    pub field_id: i64,
    pub current_value: serde_json::Value,
    pub attempted_value: serde_json::Value,
    pub current_formula_expr: Option<String>,
    pub attempted_formula_expr: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchWriteOutcome {
    pub revision: i64,
    pub written: usize,
}

/// Payload for record creation. Values and formulas are keyed by field id;
/// formula entries are only legal for formula fields.
#[derive(Clone, Debug, Default)]
pub struct CreateRecord {
    pub values: HashMap<i64, serde_json::Value>,
    pub formulas: HashMap<i64, String>,
    pub readonly: bool,
    pub metadata: Option<serde_json::Value>,
}

/// Partial update for an existing record. `None` leaves a part untouched.
#[derive(Clone, Debug, Default)]
pub struct UpdateRecord {
    pub readonly: Option<bool>,
    pub metadata: Option<serde_json::Value>,
    pub values: Option<HashMap<i64, serde_json::Value>>,
    pub formulas: Option<HashMap<i64, String>>,
}

/// Actions recorded in the append-only audit log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    WriteCells,
    Import,
    Export,
    SchemaChange,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Login => "login",
            AuditAction::WriteCells => "write_cells",
            AuditAction::Import => "import",
            AuditAction::Export => "export",
            AuditAction::SchemaChange => "schema_change",
        }
    }

    pub fn parse(s: &str) -> Option<AuditAction> {
        match s {
            "login" => Some(AuditAction::Login),
            "write_cells" => Some(AuditAction::WriteCells),
            "import" => Some(AuditAction::Import),
            "export" => Some(AuditAction::Export),
            "schema_change" => Some(AuditAction::SchemaChange),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEntry {
    pub id: i64,
    pub action: AuditAction,
    pub user_id: Option<i64>,
    pub table_id: Option<i64>,
    pub view_id: Option<i64>,
    pub row_count: i64,
}
