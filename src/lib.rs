//! SchemaFlow Guard - Schema Migration Safety Engine
//!
//! Makes destructive PostgreSQL schema changes safe to run:
//! - Dependency discovery over the system catalog
//! - Weighted risk scoring with recommendations
//! - Staged execution with backups, per-step rollback and an exclusive target lock
//! - Staging rehearsal with independent validation checkpoints

pub mod analysis;
pub mod change;
pub mod config;
pub mod db;
pub mod error;
pub mod introspection;
pub mod operation;
pub mod risk;
pub mod sql;
pub mod staging;
pub mod validation;

#[cfg(test)]
pub(crate) mod testing;

pub use analysis::{DependencyAnalyzer, DependencyReport, ForeignKeyImpactAnalyzer};
pub use change::{ChangeExecutor, ChangePlan, ChangePlanner, TargetLockRegistry};
pub use config::{GuardConfig, Settings};
pub use error::{GuardError, GuardResult};
pub use operation::{MigrationOperation, OperationKind};
pub use risk::{ComprehensiveRiskAssessment, RiskAssessmentEngine, RiskLevel};
pub use sql::{Ident, TableRef};
pub use staging::{ProductionDatabase, StagingEnvironmentManager};
pub use validation::{MigrationInfo, MigrationValidationResult, ValidationPipeline};
