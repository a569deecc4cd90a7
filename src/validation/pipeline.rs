//! Validation orchestration

use super::checkpoints::{
    constraint_states, run_checkpoint, time_queries, Baseline, CheckpointContext,
};
use super::{
    aggregate_status, CheckpointResult, CheckpointType, MigrationInfo, MigrationValidationResult,
    Severity, ValidationError,
};
use crate::analysis::{DependencyAnalyzer, DependencyReport, FkDirection, ForeignKeyImpactAnalyzer};
use crate::config::GuardConfig;
use crate::error::{validation_error, GuardResult};
use crate::operation::MigrationOperation;
use crate::risk::{ComprehensiveRiskAssessment, RiskAssessmentEngine, RiskLevel};
use crate::sql::{Ident, TableRef};
use crate::staging::{ProductionDatabase, StagingEnvironmentManager, StagingHandle};
use chrono::Utc;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

static QUALIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:"((?:[^"]|"")+)"|([A-Za-z_][A-Za-z0-9_$]*))\s*\.\s*["A-Za-z_]"#)
        .expect("static regex")
});

pub struct ValidationPipeline {
    staging: Arc<StagingEnvironmentManager>,
    engine: RiskAssessmentEngine,
    config: GuardConfig,
}

impl ValidationPipeline {
    pub fn new(staging: Arc<StagingEnvironmentManager>, config: GuardConfig) -> GuardResult<Self> {
        config.validate()?;
        Ok(Self {
            staging,
            engine: RiskAssessmentEngine::new(config.risk_weights)?,
            config,
        })
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Rehearse `info` on a fresh staging clone of `production`
    ///
    /// Only an invalid request is an error. Staging failures, timeouts and failed
    /// checkpoints are all reported as a FAILED result.
    pub async fn validate_migration(
        &self,
        info: &MigrationInfo,
        production: &ProductionDatabase,
    ) -> GuardResult<MigrationValidationResult> {
        info.validate().map_err(|e| validation_error(e.to_string()))?;
        let requested = with_unique_checkpoints(info);
        let info = &requested;
        let started_at = Utc::now();
        info!("🧪 Validating migration {} ({})", info.id, info.operation.kind);

        let mut errors = Vec::new();
        // Highest impact among dependencies found in production and on the clone
        let mut dependency_risk = RiskLevel::Low;
        let preflight = self
            .preflight(info, production, &mut errors, &mut dependency_risk)
            .await;

        let mut checkpoints: Vec<CheckpointResult> = Vec::new();
        let mut staging_environment = None;

        match self
            .staging
            .reserve(production, self.config.staging_sample_ratio)
            .await
        {
            Ok(env) => {
                staging_environment = Some(env.id);
                let staged = tokio::time::timeout(
                    self.config.validation_timeout,
                    self.run_in_staging(
                        env.id,
                        info,
                        production,
                        &mut checkpoints,
                        &mut errors,
                        &mut dependency_risk,
                    ),
                )
                .await;
                if staged.is_err() {
                    warn!(
                        "⏱️ Validation of {} exceeded {:?}",
                        info.id, self.config.validation_timeout
                    );
                    errors.push(ValidationError::new(
                        "TIMEOUT",
                        format!(
                            "Validation exceeded {:?}; unfinished checkpoints were cancelled",
                            self.config.validation_timeout
                        ),
                        Severity::Critical,
                    ));
                }

                if let Err(e) = self.staging.cleanup_staging_environment(env.id).await {
                    error!("Staging environment {} leaked: {}", env.id, e);
                    errors.push(ValidationError::new(
                        "STAGING_CLEANUP_FAILED",
                        format!("Staging environment {} could not be removed: {}", env.id, e),
                        Severity::Error,
                    ));
                }
            }
            Err(e) => errors.push(ValidationError::new(
                "STAGING_UNAVAILABLE",
                e.to_string(),
                Severity::Critical,
            )),
        }

        for checkpoint in &info.checkpoints {
            if !checkpoints.iter().any(|c| c.checkpoint == *checkpoint) {
                checkpoints.push(CheckpointResult::not_run(*checkpoint, "validation stopped early"));
            }
        }
        checkpoints.sort_by_key(|c| c.checkpoint);

        let overall_risk_level = overall_risk(
            preflight.as_ref(),
            dependency_risk,
            &checkpoints,
            &errors,
        );
        let status = aggregate_status(&checkpoints, &errors);

        info!(
            "🧪 Migration {} {:?}: {}/{} checkpoints passed, risk {}",
            info.id,
            status,
            checkpoints.iter().filter(|c| c.passed()).count(),
            checkpoints.len(),
            overall_risk_level
        );

        Ok(MigrationValidationResult {
            migration_id: info.id.clone(),
            status,
            checkpoints,
            validation_errors: errors,
            overall_risk_level,
            preflight,
            staging_environment,
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// Score the migration against production before touching staging
    async fn preflight(
        &self,
        info: &MigrationInfo,
        production: &ProductionDatabase,
        errors: &mut Vec<ValidationError>,
        dependency_risk: &mut RiskLevel,
    ) -> Option<ComprehensiveRiskAssessment> {
        let op = &info.operation;
        let analyzer = DependencyAnalyzer::new(production.introspector.clone());
        let report = match analyze(&analyzer, op, &op.table).await {
            Ok(report) => {
                *dependency_risk = (*dependency_risk).max(report.max_impact());
                report
            }
            Err(e) => {
                errors.push(ValidationError::new(
                    "PREFLIGHT_FAILED",
                    format!("Production dependency analysis failed: {}", e),
                    Severity::Critical,
                ));
                return None;
            }
        };

        let fk_analyzer = ForeignKeyImpactAnalyzer::new(production.introspector.clone());
        let fk_impact = match &op.column {
            Some(column) => {
                fk_analyzer
                    .analyze_column_foreign_key_impact(&op.table, column, op.kind)
                    .await
            }
            None => fk_analyzer.analyze_foreign_key_impact(&op.table, op.kind).await,
        };
        let fk_impact = fk_impact
            .map_err(|e| warn!("FK impact unavailable for {}: {}", op.table, e))
            .ok();

        let mut scored = op.clone();
        if scored.rollback_sql.is_none() {
            scored.rollback_sql = info.rollback_sql.clone();
        }
        Some(
            self.engine
                .calculate_migration_risk_score(&scored, &report, fk_impact.as_ref()),
        )
    }

    /// Provision, replicate, baseline, migrate, then run checkpoints
    ///
    /// Results are pushed into `checkpoints` as they finish so a timeout keeps them.
    async fn run_in_staging(
        &self,
        env_id: Uuid,
        info: &MigrationInfo,
        production: &ProductionDatabase,
        checkpoints: &mut Vec<CheckpointResult>,
        errors: &mut Vec<ValidationError>,
        dependency_risk: &mut RiskLevel,
    ) {
        if let Err(e) = self.staging.provision(env_id).await {
            errors.push(ValidationError::new("STAGING_UNAVAILABLE", e.to_string(), Severity::Critical));
            return;
        }
        let handle = match self.staging.replicate_schema(env_id, true).await {
            Ok(handle) => handle,
            Err(e) => {
                errors.push(ValidationError::new(
                    "STAGING_REPLICATION_FAILED",
                    e.to_string(),
                    Severity::Critical,
                ));
                return;
            }
        };

        if let Some(e) = self.schema_qualified_sql(info, &production.schema, &handle.schema) {
            errors.push(e);
            return;
        }

        let table = info.operation.table.in_schema(&handle.schema);
        let baseline = self.capture_baseline(info, &handle, &table, errors).await;
        if let Some(report) = &baseline.report {
            *dependency_risk = (*dependency_risk).max(report.max_impact());
        }

        match handle.connections.acquire().await {
            Ok(mut session) => {
                if let Err(e) = session.transaction(&info.forward_sql).await {
                    error!("Forward migration {} failed on staging: {}", info.id, e);
                    errors.push(ValidationError::new(
                        "MIGRATION_FAILED",
                        format!("Forward SQL failed on staging: {}", e),
                        Severity::Critical,
                    ));
                    return;
                }
            }
            Err(e) => {
                errors.push(ValidationError::new(
                    "STAGING_UNAVAILABLE",
                    e.to_string(),
                    Severity::Critical,
                ));
                return;
            }
        }
        info!("🧪 Forward migration {} applied on staging", info.id);

        let ctx = CheckpointContext {
            info,
            handle: &handle,
            table,
            baseline: &baseline,
            config: &self.config,
        };

        if self.config.parallel_checkpoints {
            let results = join_all(info.checkpoints.iter().map(|c| run_checkpoint(&ctx, *c))).await;
            checkpoints.extend(results);
        } else {
            for checkpoint in &info.checkpoints {
                checkpoints.push(run_checkpoint(&ctx, *checkpoint).await);
            }
        }

        for result in checkpoints.iter().filter(|c| !c.passed()) {
            let severity = if result.risk_level == RiskLevel::Critical {
                Severity::Critical
            } else {
                Severity::Error
            };
            errors.push(
                ValidationError::new("CHECKPOINT_FAILED", result.message.clone(), severity)
                    .at(result.checkpoint),
            );
        }
    }

    async fn capture_baseline(
        &self,
        info: &MigrationInfo,
        handle: &StagingHandle,
        table: &TableRef,
        errors: &mut Vec<ValidationError>,
    ) -> Baseline {
        let mut baseline = Baseline::default();
        let analyzer = DependencyAnalyzer::new(handle.introspector.clone());
        match analyze(&analyzer, &info.operation, table).await {
            Ok(report) => {
                for dep in report.all() {
                    if let Some((fk, FkDirection::Incoming)) = dep.foreign_key() {
                        if let Ok(source) = fk.source() {
                            baseline.row_counts.entry(source.in_schema(&handle.schema)).or_insert(0);
                        }
                    }
                }
                baseline.report = Some(report);
            }
            Err(e) => errors.push(ValidationError::new(
                "STAGING_ANALYSIS_FAILED",
                e.to_string(),
                Severity::Error,
            )),
        }

        baseline.row_counts.insert(table.clone(), 0);
        let tables: Vec<TableRef> = baseline.row_counts.keys().cloned().collect();
        for t in tables {
            match handle.introspector.count_rows(&t).await {
                Ok(rows) => {
                    baseline.row_counts.insert(t.clone(), rows);
                }
                Err(e) => {
                    warn!("No baseline row count for {}: {}", t, e);
                    baseline.row_counts.remove(&t);
                    continue;
                }
            }
            match constraint_states(
                handle.introspector.as_ref(),
                &t,
                Some((&info.operation, table)),
            )
            .await
            {
                Ok(states) => {
                    baseline.constraints.insert(t, states);
                }
                Err(e) => warn!("No baseline constraints for {}: {}", t, e),
            }
        }

        if !info.performance_queries.is_empty() {
            match time_queries(
                handle.connections.as_ref(),
                &info.performance_queries,
                self.config.perf_iterations,
            )
            .await
            {
                Ok(timings) => {
                    for (i, timing) in timings.iter().enumerate() {
                        if let Err(e) = timing {
                            errors.push(ValidationError::new(
                                "BASELINE_QUERY_FAILED",
                                format!("Performance query {} failed before migration: {}", i + 1, e),
                                Severity::Warning,
                            ));
                        }
                    }
                    baseline.query_timings = timings.into_iter().map(Result::ok).collect();
                }
                Err(e) => {
                    errors.push(ValidationError::new(
                        "BASELINE_QUERY_FAILED",
                        e.to_string(),
                        Severity::Warning,
                    ));
                    baseline.query_timings = vec![None; info.performance_queries.len()];
                }
            }
        }
        baseline
    }

    /// Staging sessions pin `search_path`; SQL that names the production schema explicitly
    /// would escape the clone
    fn schema_qualified_sql(
        &self,
        info: &MigrationInfo,
        production_schema: &Ident,
        staging_schema: &Ident,
    ) -> Option<ValidationError> {
        if production_schema == staging_schema {
            return None;
        }
        let statements = info
            .forward_sql
            .iter()
            .chain(info.rollback_sql.iter())
            .chain(info.performance_queries.iter());
        let offending: Vec<&String> = statements
            .filter(|sql| names_schema(sql, production_schema.as_str()))
            .collect();
        if offending.is_empty() {
            return None;
        }
        Some(ValidationError::new(
            "SCHEMA_QUALIFIED_SQL",
            format!(
                "{} statements reference schema {} explicitly and cannot be rehearsed in isolation; use unqualified names",
                offending.len(),
                production_schema
            ),
            Severity::Critical,
        ))
    }
}

/// Copy of `info` with each checkpoint listed once, first occurrence kept
fn with_unique_checkpoints(info: &MigrationInfo) -> MigrationInfo {
    let mut unique = info.clone();
    unique.checkpoints.clear();
    for checkpoint in &info.checkpoints {
        if !unique.checkpoints.contains(checkpoint) {
            unique.checkpoints.push(*checkpoint);
        }
    }
    unique
}

/// Highest level among the preflight score, discovered dependencies and checkpoint findings
///
/// Any critical validation error raises the result to CRITICAL.
fn overall_risk(
    preflight: Option<&ComprehensiveRiskAssessment>,
    dependency_risk: RiskLevel,
    checkpoints: &[CheckpointResult],
    errors: &[ValidationError],
) -> RiskLevel {
    let critical_error = errors.iter().any(|e| e.severity == Severity::Critical);
    checkpoints
        .iter()
        .map(|c| c.risk_level)
        .chain(preflight.map(|p| p.risk_level))
        .chain(std::iter::once(dependency_risk))
        .chain(critical_error.then_some(RiskLevel::Critical))
        .max()
        .unwrap_or_default()
}

async fn analyze(
    analyzer: &DependencyAnalyzer,
    op: &MigrationOperation,
    table: &TableRef,
) -> GuardResult<DependencyReport> {
    match &op.column {
        Some(column) => analyzer.analyze_column_dependencies(table, column).await,
        None => analyzer.analyze_table_dependencies(table).await,
    }
}

/// Whether `sql` qualifies an object with `schema`
fn names_schema(sql: &str, schema: &str) -> bool {
    QUALIFIER.captures_iter(sql).any(|caps| {
        match (caps.get(1), caps.get(2)) {
            (Some(quoted), _) => quoted.as_str().replace("\"\"", "\"") == schema,
            (_, Some(bare)) => bare.as_str().eq_ignore_ascii_case(schema),
            _ => false,
        }
    })
}
