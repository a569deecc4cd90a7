//! Checkpoint implementations
//!
//! Each checkpoint reads the staging clone after the forward migration has been applied and
//! compares it with the baseline captured beforehand. Checkpoints that talk to the database
//! acquire their own session.

use super::{CheckpointResult, CheckpointStatus, CheckpointType, ExpectedSchema, MigrationInfo};
use crate::analysis::DependencyReport;
use crate::config::GuardConfig;
use crate::db::ConnectionProvider;
use crate::error::{GuardError, GuardResult};
use crate::introspection::SchemaIntrospector;
use crate::operation::{MigrationOperation, OperationKind};
use crate::risk::{is_trivial_rollback, RiskLevel};
use crate::sql::{Ident, TableRef};
use crate::staging::StagingHandle;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// State of the clone before the forward migration ran
#[derive(Debug, Clone, Default)]
pub(crate) struct Baseline {
    pub row_counts: BTreeMap<TableRef, i64>,
    /// Average per query; `None` when the query failed before the change
    pub query_timings: Vec<Option<Duration>>,
    pub report: Option<DependencyReport>,
    /// Constraint and FK names per table with their validated flag, minus the ones the
    /// operation itself removes
    pub constraints: BTreeMap<TableRef, BTreeMap<String, bool>>,
}

/// Constraints and foreign keys on `table`, by name, with their validated flag
///
/// With `operation`, constraints the operation is expected to remove are left out.
pub(crate) async fn constraint_states(
    introspector: &dyn SchemaIntrospector,
    table: &TableRef,
    operation: Option<(&MigrationOperation, &TableRef)>,
) -> GuardResult<BTreeMap<String, bool>> {
    let removed_column = operation.and_then(|(op, target)| match op.kind {
        OperationKind::RemoveColumn => op.column.as_deref().map(|c| (target, c)),
        _ => None,
    });

    let mut states = BTreeMap::new();
    for constraint in introspector.list_constraints(table).await? {
        let casualty = matches!(removed_column, Some((target, column))
            if target == table && constraint.columns.iter().any(|c| c == column));
        if !casualty {
            states.insert(constraint.name, constraint.validated);
        }
    }
    for fk in introspector.list_foreign_keys(table).await? {
        let casualty = match removed_column {
            Some((target, column)) => {
                (fk.source().ok().as_ref() == Some(target)
                    && fk.source_columns.iter().any(|c| c == column))
                    || (fk.referenced().ok().as_ref() == Some(target)
                        && fk.referenced_columns.iter().any(|c| c == column))
            }
            None => false,
        };
        if !casualty {
            states.insert(fk.constraint_name, fk.validated);
        }
    }
    Ok(states)
}

pub(crate) struct CheckpointContext<'a> {
    pub info: &'a MigrationInfo,
    pub handle: &'a StagingHandle,
    /// Migration target inside the staging schema
    pub table: TableRef,
    pub baseline: &'a Baseline,
    pub config: &'a GuardConfig,
}

impl CheckpointContext<'_> {
    /// Where the target table lives after the migration
    fn table_after(&self) -> GuardResult<Option<TableRef>> {
        let op = &self.info.operation;
        Ok(match op.kind {
            OperationKind::DropTable => None,
            OperationKind::RenameTable => match &op.new_name {
                Some(name) => Some(self.table.renamed(&Ident::new(name.as_str())?)),
                None => Some(self.table.clone()),
            },
            _ => Some(self.table.clone()),
        })
    }

    fn resolve(&self, path: &str) -> GuardResult<TableRef> {
        TableRef::parse(path, self.handle.schema.as_str()).map(|t| t.in_schema(&self.handle.schema))
    }
}

struct Outcome {
    status: CheckpointStatus,
    message: String,
    risk_level: RiskLevel,
    details: serde_json::Value,
}

impl Outcome {
    fn pass(message: impl Into<String>) -> Self {
        Self {
            status: CheckpointStatus::Passed,
            message: message.into(),
            risk_level: RiskLevel::Low,
            details: serde_json::Value::Null,
        }
    }

    fn fail(message: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            status: CheckpointStatus::Failed,
            message: message.into(),
            risk_level,
            details: serde_json::Value::Null,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Run one checkpoint; errors become a FAILED result
pub(crate) async fn run_checkpoint(
    ctx: &CheckpointContext<'_>,
    checkpoint: CheckpointType,
) -> CheckpointResult {
    let started = Instant::now();
    let outcome = match checkpoint {
        CheckpointType::DependencyAnalysis => dependency_analysis(ctx).await,
        CheckpointType::PerformanceValidation => performance_validation(ctx).await,
        CheckpointType::RollbackValidation => rollback_validation(ctx).await,
        CheckpointType::DataIntegrity => data_integrity(ctx).await,
        CheckpointType::SchemaConsistency => schema_consistency(ctx).await,
    };
    let outcome = outcome.unwrap_or_else(|e| {
        warn!("{} errored: {}", checkpoint, e);
        Outcome::fail(format!("{} could not complete: {}", checkpoint, e), RiskLevel::High)
    });
    debug!("{} → {:?} ({})", checkpoint, outcome.status, outcome.message);

    CheckpointResult {
        checkpoint,
        status: outcome.status,
        message: outcome.message,
        risk_level: outcome.risk_level,
        duration_ms: started.elapsed().as_millis() as u64,
        details: outcome.details,
    }
}

// =============================================================================
// DEPENDENCY_ANALYSIS
// =============================================================================

async fn dependency_analysis(ctx: &CheckpointContext<'_>) -> GuardResult<Outcome> {
    let Some(report) = &ctx.baseline.report else {
        return Ok(Outcome::fail(
            "Dependency report for the staging clone is unavailable",
            RiskLevel::High,
        ));
    };

    let critical: Vec<String> = report
        .critical()
        .iter()
        .map(|d| format!("{}: {}", d.qualified_name(), d.description))
        .collect();
    let details = json!({
        "dependencies": report.count(),
        "maxImpact": report.max_impact(),
        "critical": critical,
    });

    if critical.is_empty() {
        Ok(Outcome {
            risk_level: report.max_impact(),
            ..Outcome::pass(format!(
                "{} dependencies found, none critical",
                report.count()
            ))
        }
        .with_details(details))
    } else {
        Ok(Outcome::fail(
            format!("{} critical dependencies: {}", critical.len(), critical.join("; ")),
            RiskLevel::Critical,
        )
        .with_details(details))
    }
}

// =============================================================================
// PERFORMANCE_VALIDATION
// =============================================================================

/// Average duration of each query over `iterations` runs on one session
pub(crate) async fn time_queries(
    connections: &dyn ConnectionProvider,
    queries: &[String],
    iterations: u32,
) -> GuardResult<Vec<Result<Duration, String>>> {
    let mut session = connections.acquire().await?;
    let iterations = iterations.max(1);
    let mut timings = Vec::with_capacity(queries.len());

    for query in queries {
        let mut total = Duration::ZERO;
        let mut failure = None;
        for _ in 0..iterations {
            let started = Instant::now();
            if let Err(e) = session.execute(query).await {
                failure = Some(e.to_string());
                break;
            }
            total += started.elapsed();
        }
        timings.push(match failure {
            Some(e) => Err(e),
            None => Ok(total / iterations),
        });
    }
    Ok(timings)
}

async fn performance_validation(ctx: &CheckpointContext<'_>) -> GuardResult<Outcome> {
    let queries = &ctx.info.performance_queries;
    if queries.is_empty() {
        return Ok(Outcome::pass("No performance queries configured"));
    }

    let after = time_queries(
        ctx.handle.connections.as_ref(),
        queries,
        ctx.config.perf_iterations,
    )
    .await?;

    let mut failures = Vec::new();
    let mut degradations = Vec::new();
    let mut per_query = Vec::new();
    for (i, (before, after)) in ctx.baseline.query_timings.iter().zip(&after).enumerate() {
        match (before, after) {
            (_, Err(e)) => failures.push(format!("query {} failed after migration: {}", i + 1, e)),
            (Some(before), Ok(after)) if !before.is_zero() => {
                let change = (after.as_secs_f64() - before.as_secs_f64()) / before.as_secs_f64();
                degradations.push(change);
                per_query.push(json!({
                    "query": i + 1,
                    "beforeMs": before.as_secs_f64() * 1000.0,
                    "afterMs": after.as_secs_f64() * 1000.0,
                    "change": change,
                }));
            }
            _ => {}
        }
    }

    let average = if degradations.is_empty() {
        0.0
    } else {
        degradations.iter().sum::<f64>() / degradations.len() as f64
    };
    let threshold = ctx.config.perf_degradation_threshold;
    let details = json!({
        "averageDegradation": average,
        "threshold": threshold,
        "queries": per_query,
    });

    if !failures.is_empty() {
        return Ok(Outcome::fail(failures.join("; "), RiskLevel::High).with_details(details));
    }
    if average > threshold {
        return Ok(Outcome::fail(
            format!(
                "Average query time degraded by {:.0}% (limit {:.0}%)",
                average * 100.0,
                threshold * 100.0
            ),
            RiskLevel::High,
        )
        .with_details(details));
    }
    Ok(Outcome::pass(format!(
        "Average query time change {:+.0}% within {:.0}% limit",
        average * 100.0,
        threshold * 100.0
    ))
    .with_details(details))
}

// =============================================================================
// ROLLBACK_VALIDATION
// =============================================================================

async fn rollback_validation(ctx: &CheckpointContext<'_>) -> GuardResult<Outcome> {
    let rollback = ctx
        .info
        .rollback_sql
        .as_deref()
        .map(str::trim)
        .filter(|sql| !sql.is_empty());
    let Some(rollback) = rollback else {
        return Ok(Outcome::fail(
            "Migration rollback SQL is empty or missing",
            RiskLevel::High,
        ));
    };
    if is_trivial_rollback(Some(rollback)) {
        return Ok(Outcome::fail(
            "Migration rollback SQL contains no effective statements",
            RiskLevel::High,
        ));
    }

    let mut session = ctx.handle.connections.acquire().await?;
    match session.rehearse(&[rollback.to_string()]).await {
        Ok(()) => Ok(Outcome::pass("Rollback SQL executed cleanly on staging")),
        Err(e) => Ok(Outcome::fail(
            format!("Rollback SQL failed on staging: {}", e),
            RiskLevel::High,
        )),
    }
}

// =============================================================================
// DATA_INTEGRITY
// =============================================================================

async fn data_integrity(ctx: &CheckpointContext<'_>) -> GuardResult<Outcome> {
    let target_after = ctx.table_after()?;
    let introspector = ctx.handle.introspector.as_ref();
    let mut problems = Vec::new();
    let mut counts = Vec::new();

    for (table, before) in &ctx.baseline.row_counts {
        let current = if *table == ctx.table {
            match &target_after {
                Some(t) => t.clone(),
                None => continue,
            }
        } else {
            table.clone()
        };

        if !introspector.table_exists(&current).await? {
            problems.push(format!("{} no longer exists", current));
            continue;
        }
        let after = introspector.count_rows(&current).await?;
        counts.push(json!({ "table": current.to_string(), "before": before, "after": after }));
        if after < *before {
            problems.push(format!("{} lost {} rows ({} → {})", current, before - after, before, after));
        }
    }

    let mut checked_constraints = 0usize;
    for (table, before) in &ctx.baseline.constraints {
        let current = if *table == ctx.table {
            match &target_after {
                Some(t) => t.clone(),
                None => continue,
            }
        } else {
            table.clone()
        };
        if !introspector.table_exists(&current).await? {
            continue;
        }

        let after = constraint_states(introspector, &current, None).await?;
        for (name, was_validated) in before {
            checked_constraints += 1;
            match after.get(name) {
                None => problems.push(format!("constraint {} on {} was dropped", name, current)),
                Some(false) if *was_validated => problems.push(format!(
                    "constraint {} on {} is no longer validated",
                    name, current
                )),
                Some(_) => {}
            }
        }
    }

    let details = json!({ "rowCounts": counts, "constraintsChecked": checked_constraints });
    if problems.is_empty() {
        Ok(Outcome::pass(format!(
            "Row counts and {} constraints preserved across {} tables",
            checked_constraints,
            counts.len()
        ))
        .with_details(details))
    } else {
        Ok(Outcome::fail(problems.join("; "), RiskLevel::Critical).with_details(details))
    }
}

// =============================================================================
// SCHEMA_CONSISTENCY
// =============================================================================

/// Expectations implied by the operation itself
fn implied_expectations(ctx: &CheckpointContext<'_>) -> ExpectedSchema {
    let op = &ctx.info.operation;
    let table = ctx.table.name.to_string();
    let mut expected = ExpectedSchema::default();
    match op.kind {
        OperationKind::RemoveColumn => {
            if let Some(column) = &op.column {
                expected.tables_present.push(table.clone());
                expected.columns_absent.push(format!("{}.{}", table, column));
            }
        }
        OperationKind::DropTable => expected.tables_absent.push(table),
        OperationKind::RenameTable => {
            if let Some(new_name) = &op.new_name {
                expected.tables_absent.push(table);
                expected.tables_present.push(new_name.clone());
            }
        }
        OperationKind::RenameColumn => {
            if let (Some(column), Some(new_name)) = (&op.column, &op.new_name) {
                expected.columns_absent.push(format!("{}.{}", table, column));
                expected.columns_present.push(format!("{}.{}", table, new_name));
            }
        }
        OperationKind::AlterColumnType => {
            if let Some(column) = &op.column {
                expected.columns_present.push(format!("{}.{}", table, column));
            }
        }
    }
    expected
}

fn split_column_path(path: &str) -> GuardResult<(&str, &str)> {
    path.rsplit_once('.')
        .ok_or_else(|| GuardError::Validation(format!("expected table.column, got {}", path)))
}

async fn schema_consistency(ctx: &CheckpointContext<'_>) -> GuardResult<Outcome> {
    let introspector = ctx.handle.introspector.as_ref();
    let mut expectations = vec![implied_expectations(ctx)];
    if let Some(declared) = &ctx.info.expected_schema {
        expectations.push(declared.clone());
    }

    let mut mismatches = Vec::new();
    let mut checked = 0usize;
    for expected in &expectations {
        for path in &expected.tables_present {
            checked += 1;
            if !introspector.table_exists(&ctx.resolve(path)?).await? {
                mismatches.push(format!("expected table {} to exist", path));
            }
        }
        for path in &expected.tables_absent {
            checked += 1;
            if introspector.table_exists(&ctx.resolve(path)?).await? {
                mismatches.push(format!("expected table {} to be gone", path));
            }
        }
        for path in &expected.columns_present {
            checked += 1;
            let (table, column) = split_column_path(path)?;
            if !introspector.column_exists(&ctx.resolve(table)?, column).await? {
                mismatches.push(format!("expected column {} to exist", path));
            }
        }
        for path in &expected.columns_absent {
            checked += 1;
            let (table, column) = split_column_path(path)?;
            if introspector.column_exists(&ctx.resolve(table)?, column).await? {
                mismatches.push(format!("expected column {} to be gone", path));
            }
        }
    }

    let details = json!({ "checked": checked, "mismatches": mismatches });
    if mismatches.is_empty() {
        Ok(Outcome::pass(format!("Catalog matches all {} expectations", checked))
            .with_details(details))
    } else {
        Ok(Outcome::fail(
            format!("Catalog differs from the declared target: {}", mismatches.join("; ")),
            RiskLevel::High,
        )
        .with_details(details))
    }
}
