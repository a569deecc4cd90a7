//! Staged Change Execution
//!
//! Destructive changes are planned as an ordered list of steps, each with forward and
//! rollback SQL, then executed one transaction per step under an exclusive target lock.
//!
//! Stage order:
//! VALIDATE_TARGET → BACKUP_CREATION → DROP_CONSTRAINTS / DROP_INDEXES | DISABLE_FOREIGN_KEYS
//! → APPLY_CHANGE → RECREATE_DEPENDENTS | ENABLE_FOREIGN_KEYS → VALIDATION

mod executor;
mod lock;
mod planner;

pub use executor::{
    ChangeExecutionResult, ChangeExecutor, ExecutionOptions, ExecutionOutcome, StageRecord,
    StageStatus,
};
pub use lock::{TargetLockGuard, TargetLockRegistry};
pub use planner::ChangePlanner;

use crate::analysis::{DependencyReport, FkImpactReport};
use crate::error::{GuardError, GuardResult};
use crate::introspection::SchemaIntrospector;
use crate::operation::OperationKind;
use crate::risk::{ComprehensiveRiskAssessment, RiskLevel};
use crate::sql::TableRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// PLAN TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    ValidateTarget,
    BackupCreation,
    DropConstraints,
    DropIndexes,
    DisableForeignKeys,
    ApplyChange,
    RecreateDependents,
    EnableForeignKeys,
    Validation,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageKind::ValidateTarget => "VALIDATE_TARGET",
            StageKind::BackupCreation => "BACKUP_CREATION",
            StageKind::DropConstraints => "DROP_CONSTRAINTS",
            StageKind::DropIndexes => "DROP_INDEXES",
            StageKind::DisableForeignKeys => "DISABLE_FOREIGN_KEYS",
            StageKind::ApplyChange => "APPLY_CHANGE",
            StageKind::RecreateDependents => "RECREATE_DEPENDENTS",
            StageKind::EnableForeignKeys => "ENABLE_FOREIGN_KEYS",
            StageKind::Validation => "VALIDATION",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStrategy {
    /// Primary key plus the target column
    ColumnOnly,
    /// Every row, every column
    TableSnapshot,
    /// Nothing is destroyed
    NotRequired,
}

/// Post-condition checked against the catalog after a step commits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Verification {
    TableExists { table: TableRef },
    TableAbsent { table: TableRef },
    ColumnPresent { table: TableRef, column: String },
    ColumnAbsent { table: TableRef, column: String },
    /// Row count equals the count captured before the first step
    RowCountUnchanged { table: TableRef },
}

impl Verification {
    pub async fn check(
        &self,
        introspector: &dyn SchemaIntrospector,
        baseline_rows: Option<i64>,
    ) -> GuardResult<()> {
        let failed = |msg: String| Err(GuardError::Validation(msg));
        match self {
            Verification::TableExists { table } => {
                if !introspector.table_exists(table).await? {
                    return failed(format!("table {} does not exist", table));
                }
            }
            Verification::TableAbsent { table } => {
                if introspector.table_exists(table).await? {
                    return failed(format!("table {} already exists", table));
                }
            }
            Verification::ColumnPresent { table, column } => {
                if !introspector.column_exists(table, column).await? {
                    return failed(format!("column {}.{} does not exist", table, column));
                }
            }
            Verification::ColumnAbsent { table, column } => {
                if introspector.column_exists(table, column).await? {
                    return failed(format!("column {}.{} is still present", table, column));
                }
            }
            Verification::RowCountUnchanged { table } => {
                let Some(expected) = baseline_rows else {
                    return failed(format!("no baseline row count recorded for {}", table));
                };
                let rows = introspector.count_rows(table).await?;
                if rows != expected {
                    return failed(format!(
                        "row count of {} changed from {} to {}",
                        table, expected, rows
                    ));
                }
            }
        }
        Ok(())
    }
}

/// One unit of work, committed in its own transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStep {
    pub stage: StageKind,
    /// Short verb such as `drop_foreign_key` or `rename_table`
    pub action: String,
    pub description: String,
    pub forward_sql: Vec<String>,
    /// Statements that undo `forward_sql`, in execution order
    pub rollback_sql: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verifications: Vec<Verification>,
    pub risk_level: RiskLevel,
    pub dry_run: bool,
}

impl ChangeStep {
    fn new(stage: StageKind, action: &str, description: impl Into<String>) -> Self {
        Self {
            stage,
            action: action.to_string(),
            description: description.into(),
            forward_sql: Vec::new(),
            rollback_sql: Vec::new(),
            verifications: Vec::new(),
            risk_level: RiskLevel::Low,
            dry_run: false,
        }
    }

    fn forward(mut self, sql: impl Into<String>) -> Self {
        self.forward_sql.push(sql.into());
        self
    }

    fn rollback(mut self, sql: impl Into<String>) -> Self {
        self.rollback_sql.push(sql.into());
        self
    }

    fn verify(mut self, verification: Verification) -> Self {
        self.verifications.push(verification);
        self
    }

    fn risk(mut self, level: RiskLevel) -> Self {
        self.risk_level = level;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOptions {
    pub dry_run: bool,
    pub is_production: bool,
}

/// Ordered, self-contained description of one destructive change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlan {
    pub id: Uuid,
    pub operation: OperationKind,
    pub table: TableRef,
    /// Column for removals, new table name for renames
    pub target: String,
    pub backup_strategy: BackupStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_table: Option<TableRef>,
    pub steps: Vec<ChangeStep>,
    pub dependencies: DependencyReport,
    pub risk: ComprehensiveRiskAssessment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fk_impact: Option<FkImpactReport>,
    pub warnings: Vec<String>,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
}

impl ChangePlan {
    /// Keys of the exclusive locks execution must hold
    pub fn lock_keys(&self) -> Vec<String> {
        let mut keys = vec![self.table.key()];
        if self.operation == OperationKind::RenameTable {
            keys.push(format!("{}.{}", self.table.schema, self.target));
        }
        keys
    }

    pub fn stages(&self) -> Vec<StageKind> {
        let mut stages: Vec<StageKind> = self.steps.iter().map(|s| s.stage).collect();
        stages.dedup();
        stages
    }

    pub fn position_of(&self, action: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.action == action)
    }
}

/// Outcome of the pre-execution safety gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyReport {
    pub is_safe: bool,
    pub requires_confirmation: bool,
    pub risk_level: RiskLevel,
    pub blocking_dependencies: Vec<String>,
    pub warnings: Vec<String>,
}
