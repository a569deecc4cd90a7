//! Schema operations under assessment

use crate::sql::TableRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of schema change being assessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    RemoveColumn,
    DropTable,
    AlterColumnType,
    RenameTable,
    RenameColumn,
}

impl OperationKind {
    /// Whether the change can destroy stored data
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            OperationKind::RemoveColumn | OperationKind::DropTable | OperationKind::AlterColumnType
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationKind::RemoveColumn => "remove column",
            OperationKind::DropTable => "drop table",
            OperationKind::AlterColumnType => "alter column type",
            OperationKind::RenameTable => "rename table",
            OperationKind::RenameColumn => "rename column",
        };
        f.write_str(label)
    }
}

/// A change plus the operational context risk scoring depends on
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOperation {
    pub kind: OperationKind,
    pub table: TableRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    /// New name for renames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(default)]
    pub is_production: bool,
    #[serde(default)]
    pub has_backup: bool,
    /// Rollback SQL the operator intends to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_sql: Option<String>,
    /// Row count of the target table, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<i64>,
}

impl MigrationOperation {
    pub fn new(kind: OperationKind, table: TableRef) -> Self {
        Self {
            kind,
            table,
            column: None,
            new_name: None,
            is_production: false,
            has_backup: false,
            rollback_sql: None,
            estimated_rows: None,
        }
    }

    pub fn remove_column(table: TableRef, column: impl Into<String>) -> Self {
        Self::new(OperationKind::RemoveColumn, table).with_column(column)
    }

    pub fn rename_table(table: TableRef, new_name: impl Into<String>) -> Self {
        Self {
            new_name: Some(new_name.into()),
            ..Self::new(OperationKind::RenameTable, table)
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn in_production(mut self, is_production: bool) -> Self {
        self.is_production = is_production;
        self
    }

    pub fn with_backup(mut self, has_backup: bool) -> Self {
        self.has_backup = has_backup;
        self
    }

    pub fn with_rollback_sql(mut self, sql: impl Into<String>) -> Self {
        self.rollback_sql = Some(sql.into());
        self
    }

    pub fn with_estimated_rows(mut self, rows: i64) -> Self {
        self.estimated_rows = Some(rows);
        self
    }

    /// Human-readable target path
    pub fn target_path(&self) -> String {
        match &self.column {
            Some(column) => format!("{}.{}", self.table, column),
            None => self.table.to_string(),
        }
    }
}
