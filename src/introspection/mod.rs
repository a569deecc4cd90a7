//! Schema Introspection Module
//!
//! Catalog metadata for one table at a time, behind a backend-neutral capability trait.
//! The analyzers never branch on engine type; each backend implements `SchemaIntrospector`.

mod postgres;

pub use postgres::PgIntrospector;

use crate::error::GuardError;
use crate::sql::TableRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Referential action for ON DELETE / ON UPDATE
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }

    /// Decode `pg_constraint.confdeltype` / `confupdtype`
    pub fn from_pg_code(code: &str) -> Self {
        match code {
            "r" => ReferentialAction::Restrict,
            "c" => ReferentialAction::Cascade,
            "n" => ReferentialAction::SetNull,
            "d" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }
}

impl fmt::Display for ReferentialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

/// Column representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    pub is_primary_key: bool,
}

/// Foreign key relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyInfo {
    pub constraint_name: String,
    pub source_schema: String,
    pub source_table: String,
    pub source_columns: Vec<String>,
    pub referenced_schema: String,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_update: ReferentialAction,
    pub on_delete: ReferentialAction,
    /// False for `NOT VALID` keys whose existing rows were never checked
    #[serde(default = "validated_by_default")]
    pub validated: bool,
}

impl ForeignKeyInfo {
    pub fn source(&self) -> Result<TableRef, GuardError> {
        TableRef::new(&self.source_schema, &self.source_table)
    }

    pub fn referenced(&self) -> Result<TableRef, GuardError> {
        TableRef::new(&self.referenced_schema, &self.referenced_table)
    }

    pub fn is_self_reference(&self) -> bool {
        self.source_schema == self.referenced_schema && self.source_table == self.referenced_table
    }
}

/// Index representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub name: String,
    pub schema: String,
    pub table: String,
    /// Plain key columns, in key order; expression slots are omitted
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub is_primary: bool,
    /// Access method (btree, gin, gist, ...)
    pub index_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    /// Full `CREATE INDEX` statement
    pub definition: String,
}

/// View or materialized view depending on a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewInfo {
    pub schema: String,
    pub name: String,
    pub is_materialized: bool,
    /// Defining query
    pub definition: String,
    /// Columns of the inspected table the catalog records as used, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referenced_columns: Option<Vec<String>>,
}

/// Trigger attached to a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInfo {
    pub name: String,
    pub schema: String,
    pub table: String,
    pub function_name: String,
    /// Procedural body of the trigger function
    pub function_body: String,
    /// `UPDATE OF` column list
    #[serde(default)]
    pub update_columns: Vec<String>,
    /// Full `CREATE TRIGGER` statement
    pub definition: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    Check,
    Exclusion,
}

impl ConstraintKind {
    pub fn from_pg_code(code: &str) -> Option<Self> {
        match code {
            "p" => Some(ConstraintKind::PrimaryKey),
            "u" => Some(ConstraintKind::Unique),
            "c" => Some(ConstraintKind::Check),
            "x" => Some(ConstraintKind::Exclusion),
            _ => None,
        }
    }
}

/// Non-FK table constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintInfo {
    pub name: String,
    pub schema: String,
    pub table: String,
    pub kind: ConstraintKind,
    pub columns: Vec<String>,
    /// Body as accepted by `ADD CONSTRAINT name <definition>`
    pub definition: String,
    #[serde(default = "validated_by_default")]
    pub validated: bool,
}

fn validated_by_default() -> bool {
    true
}

/// Catalog metadata source for one backend
///
/// Implementations must bind identifiers as parameters and treat them as opaque values.
/// A missing table yields empty lists, not an error.
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    async fn table_exists(&self, table: &TableRef) -> Result<bool, GuardError>;

    async fn list_columns(&self, table: &TableRef) -> Result<Vec<ColumnInfo>, GuardError>;

    /// Foreign keys where the table is either the referencing or the referenced side
    async fn list_foreign_keys(&self, table: &TableRef) -> Result<Vec<ForeignKeyInfo>, GuardError>;

    async fn list_indexes(&self, table: &TableRef) -> Result<Vec<IndexInfo>, GuardError>;

    /// Views and materialized views whose definition depends on the table
    async fn list_views(&self, table: &TableRef) -> Result<Vec<ViewInfo>, GuardError>;

    async fn list_triggers(&self, table: &TableRef) -> Result<Vec<TriggerInfo>, GuardError>;

    /// PRIMARY KEY, UNIQUE, CHECK and EXCLUSION constraints
    async fn list_constraints(&self, table: &TableRef) -> Result<Vec<ConstraintInfo>, GuardError>;

    /// Exact row count
    async fn count_rows(&self, table: &TableRef) -> Result<i64, GuardError>;

    /// Rows whose `columns` are all non-NULL, i.e. rows that reference something through an FK
    /// on those columns; defaults to every row
    async fn count_referencing_rows(
        &self,
        table: &TableRef,
        columns: &[String],
    ) -> Result<i64, GuardError> {
        let _ = columns;
        self.count_rows(table).await
    }

    /// Planner estimate; defaults to an exact count
    async fn estimate_rows(&self, table: &TableRef) -> Result<i64, GuardError> {
        self.count_rows(table).await
    }

    /// Whether the column exists on the table
    async fn column_exists(&self, table: &TableRef, column: &str) -> Result<bool, GuardError> {
        Ok(self
            .list_columns(table)
            .await?
            .iter()
            .any(|c| c.name == column))
    }
}
