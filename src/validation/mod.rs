//! Migration Validation Pipeline
//!
//! Rehearses a migration on a staging clone and runs independent checkpoints against it.
//! The staging environment is torn down on every exit path.

mod checkpoints;
mod pipeline;

pub use pipeline::ValidationPipeline;

use crate::error::{GuardError, GuardResult};
use crate::operation::MigrationOperation;
use crate::risk::{ComprehensiveRiskAssessment, RiskLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

// =============================================================================
// REQUEST
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointType {
    DependencyAnalysis,
    PerformanceValidation,
    RollbackValidation,
    DataIntegrity,
    SchemaConsistency,
}

impl CheckpointType {
    pub const ALL: [CheckpointType; 5] = [
        CheckpointType::DependencyAnalysis,
        CheckpointType::PerformanceValidation,
        CheckpointType::RollbackValidation,
        CheckpointType::DataIntegrity,
        CheckpointType::SchemaConsistency,
    ];

    pub fn all() -> Vec<CheckpointType> {
        Self::ALL.to_vec()
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckpointType::DependencyAnalysis => "DEPENDENCY_ANALYSIS",
            CheckpointType::PerformanceValidation => "PERFORMANCE_VALIDATION",
            CheckpointType::RollbackValidation => "ROLLBACK_VALIDATION",
            CheckpointType::DataIntegrity => "DATA_INTEGRITY",
            CheckpointType::SchemaConsistency => "SCHEMA_CONSISTENCY",
        };
        f.write_str(label)
    }
}

/// Declared post-migration catalog state, as `table` or `table.column` paths
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedSchema {
    #[serde(default)]
    pub tables_present: Vec<String>,
    #[serde(default)]
    pub tables_absent: Vec<String>,
    #[serde(default)]
    pub columns_present: Vec<String>,
    #[serde(default)]
    pub columns_absent: Vec<String>,
}

/// A migration submitted for validation
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MigrationInfo {
    #[validate(length(min = 1, max = 128, message = "Migration id is required"))]
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub operation: MigrationOperation,
    #[validate(length(min = 1, message = "At least one forward statement is required"))]
    pub forward_sql: Vec<String>,
    #[serde(default)]
    pub rollback_sql: Option<String>,
    /// Queries timed before and after the change
    #[serde(default)]
    pub performance_queries: Vec<String>,
    #[serde(default)]
    pub expected_schema: Option<ExpectedSchema>,
    #[serde(default = "CheckpointType::all")]
    #[validate(length(min = 1, message = "At least one checkpoint is required"))]
    pub checkpoints: Vec<CheckpointType>,
}

impl MigrationInfo {
    pub fn new(id: impl Into<String>, operation: MigrationOperation, forward_sql: Vec<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            operation,
            forward_sql,
            rollback_sql: None,
            performance_queries: Vec::new(),
            expected_schema: None,
            checkpoints: CheckpointType::all(),
        }
    }

    pub fn with_rollback_sql(mut self, sql: impl Into<String>) -> Self {
        self.rollback_sql = Some(sql.into());
        self
    }

    pub fn with_performance_queries(mut self, queries: Vec<String>) -> Self {
        self.performance_queries = queries;
        self
    }

    pub fn with_expected_schema(mut self, expected: ExpectedSchema) -> Self {
        self.expected_schema = Some(expected);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Vec<CheckpointType>) -> Self {
        self.checkpoints = checkpoints;
        self
    }
}

// =============================================================================
// RESULTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResult {
    pub checkpoint: CheckpointType,
    pub status: CheckpointStatus,
    pub message: String,
    pub risk_level: RiskLevel,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl CheckpointResult {
    pub fn passed(&self) -> bool {
        self.status == CheckpointStatus::Passed
    }

    /// Placeholder for a checkpoint that never ran
    pub(crate) fn not_run(checkpoint: CheckpointType, reason: &str) -> Self {
        Self {
            checkpoint,
            status: CheckpointStatus::Failed,
            message: format!("Checkpoint did not run: {}", reason),
            risk_level: RiskLevel::Low,
            duration_ms: 0,
            details: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    pub code: String,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointType>,
}

impl ValidationError {
    pub fn new(code: &str, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            severity,
            checkpoint: None,
        }
    }

    pub fn at(mut self, checkpoint: CheckpointType) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Passed,
    Failed,
}

/// Outcome of one validation attempt; immutable once returned
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationValidationResult {
    pub migration_id: String,
    pub status: ValidationStatus,
    pub checkpoints: Vec<CheckpointResult>,
    pub validation_errors: Vec<ValidationError>,
    pub overall_risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preflight: Option<ComprehensiveRiskAssessment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_environment: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl MigrationValidationResult {
    pub fn passed(&self) -> bool {
        self.status == ValidationStatus::Passed
    }

    pub fn checkpoint(&self, checkpoint: CheckpointType) -> Option<&CheckpointResult> {
        self.checkpoints.iter().find(|c| c.checkpoint == checkpoint)
    }

    pub fn has_critical_error(&self) -> bool {
        self.validation_errors
            .iter()
            .any(|e| e.severity == Severity::Critical)
    }

    /// Write the result as pretty JSON for audit
    pub async fn export_json(&self, path: impl AsRef<Path>) -> GuardResult<()> {
        let path = path.as_ref();
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| GuardError::Internal(format!("failed to serialize result: {}", e)))?;
        tokio::fs::write(path, body).await.map_err(|e| {
            GuardError::Internal(format!("failed to write {}: {}", path.display(), e))
        })?;
        info!("📝 Exported validation result {} to {}", self.migration_id, path.display());
        Ok(())
    }
}

/// PASSED iff every checkpoint passed and no error is critical
pub(crate) fn aggregate_status(
    checkpoints: &[CheckpointResult],
    errors: &[ValidationError],
) -> ValidationStatus {
    let all_passed = !checkpoints.is_empty() && checkpoints.iter().all(CheckpointResult::passed);
    let critical = errors.iter().any(|e| e.severity == Severity::Critical);
    if all_passed && !critical {
        ValidationStatus::Passed
    } else {
        ValidationStatus::Failed
    }
}
