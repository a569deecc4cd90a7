//! Change planning
//!
//! Reads the catalog, scores the change and lays out the ordered steps. Nothing is written.

use super::{
    BackupStrategy, ChangePlan, ChangeStep, PlanOptions, SafetyReport, StageKind, Verification,
};
use crate::analysis::{
    Dependency, DependencyAnalyzer, DependencyDetail, DependencyKind, DependencyReport,
    FkDirection, ForeignKeyImpactAnalyzer,
};
use crate::error::{planning_error, GuardResult};
use crate::introspection::{ColumnInfo, ForeignKeyInfo, SchemaIntrospector};
use crate::operation::{MigrationOperation, OperationKind};
use crate::risk::{RiskAssessmentEngine, RiskLevel};
use crate::sql::{quote_column_list, quote_ident, side_table_name, Ident, TableRef};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const BACKUP_PREFIX: &str = "sfbak";

pub struct ChangePlanner {
    introspector: Arc<dyn SchemaIntrospector>,
    analyzer: DependencyAnalyzer,
    fk_analyzer: ForeignKeyImpactAnalyzer,
    engine: RiskAssessmentEngine,
}

impl ChangePlanner {
    pub fn new(introspector: Arc<dyn SchemaIntrospector>, engine: RiskAssessmentEngine) -> Self {
        Self {
            analyzer: DependencyAnalyzer::new(introspector.clone()),
            fk_analyzer: ForeignKeyImpactAnalyzer::new(introspector.clone()),
            introspector,
            engine,
        }
    }

    // =========================================================================
    // COLUMN REMOVAL
    // =========================================================================

    /// Plan `ALTER TABLE .. DROP COLUMN` with backup, dependent handling and rollback
    pub async fn plan_column_removal(
        &self,
        table: &TableRef,
        column: &str,
        options: PlanOptions,
    ) -> GuardResult<ChangePlan> {
        info!("🧠 Planning removal of {}.{}", table, column);
        let column_ident =
            Ident::new(column).map_err(|e| planning_error(format!("invalid column name: {}", e)))?;

        if !self.introspector.table_exists(table).await? {
            return Err(planning_error(format!("table {} does not exist", table)));
        }
        let columns = self.introspector.list_columns(table).await?;
        let target = columns
            .iter()
            .find(|c| c.name == column)
            .cloned()
            .ok_or_else(|| planning_error(format!("column {}.{} does not exist", table, column)))?;

        let report = self.analyzer.analyze_column_dependencies(table, column).await?;
        let fk_impact = match self
            .fk_analyzer
            .analyze_column_foreign_key_impact(table, column, OperationKind::RemoveColumn)
            .await
        {
            Ok(impact) => Some(impact),
            Err(e) => {
                warn!("FK impact unavailable for {}.{}: {}", table, column, e);
                None
            }
        };

        let id = Uuid::new_v4();
        let restore_column = add_column_sql(table, &target);
        let mut operation = MigrationOperation::remove_column(table.clone(), column)
            .in_production(options.is_production)
            .with_backup(true)
            .with_rollback_sql(restore_column.clone());
        if let Ok(rows) = self.introspector.estimate_rows(table).await {
            operation = operation.with_estimated_rows(rows);
        }
        let risk = self
            .engine
            .calculate_migration_risk_score(&operation, &report, fk_impact.as_ref());

        let primary_key: Vec<String> = columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect();
        let snapshot = risk.risk_level == RiskLevel::Critical
            || primary_key.is_empty()
            || primary_key.iter().any(|c| c == column);
        let backup_strategy = if snapshot {
            BackupStrategy::TableSnapshot
        } else {
            BackupStrategy::ColumnOnly
        };
        let backup_table = TableRef {
            schema: table.schema.clone(),
            name: side_table_name(BACKUP_PREFIX, table, column, &id.to_string()),
        };

        let mut warnings: Vec<String> = report.warnings().to_vec();
        let mut steps = Vec::new();

        steps.push(
            ChangeStep::new(
                StageKind::ValidateTarget,
                "validate_target",
                format!("Confirm {}.{} still exists", table, column),
            )
            .verify(Verification::TableExists {
                table: table.clone(),
            })
            .verify(Verification::ColumnPresent {
                table: table.clone(),
                column: column.to_string(),
            })
            .verify(Verification::RowCountUnchanged {
                table: table.clone(),
            }),
        );

        let backup_columns = match backup_strategy {
            BackupStrategy::ColumnOnly => {
                let mut cols = primary_key.clone();
                cols.push(column.to_string());
                quote_column_list(&cols)
            }
            _ => "*".to_string(),
        };
        steps.push(
            ChangeStep::new(
                StageKind::BackupCreation,
                "create_backup",
                format!("Copy {} data into {}", table, backup_table),
            )
            .forward(format!(
                "CREATE TABLE {} AS SELECT {} FROM {}",
                backup_table.quoted(),
                backup_columns,
                table.quoted()
            ))
            .rollback(format!("DROP TABLE IF EXISTS {}", backup_table.quoted())),
        );

        steps.extend(drop_constraint_steps(table, &report, &mut warnings));

        let constraint_names: Vec<&str> = report
            .of_kind(DependencyKind::Constraint)
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        for dep in report.of_kind(DependencyKind::Index) {
            if let DependencyDetail::Index { index } = &dep.detail {
                if constraint_names.contains(&index.name.as_str()) {
                    continue;
                }
                steps.push(
                    ChangeStep::new(
                        StageKind::DropIndexes,
                        "drop_index",
                        format!("Drop index {}", index.name),
                    )
                    .forward(format!(
                        "DROP INDEX IF EXISTS {}.{}",
                        quote_ident(&index.schema),
                        quote_ident(&index.name)
                    ))
                    .rollback(index.definition.clone())
                    .risk(dep.impact),
                );
            }
        }

        let mut apply = ChangeStep::new(
            StageKind::ApplyChange,
            "drop_column",
            format!("Drop column {}.{}", table, column),
        )
        .forward(format!(
            "ALTER TABLE {} DROP COLUMN {}",
            table.quoted(),
            column_ident.quoted()
        ))
        .rollback(restore_column)
        .risk(risk.risk_level);
        for sql in restore_data_sql(table, &column_ident, &backup_table, backup_strategy, &primary_key, &columns) {
            apply = apply.rollback(sql);
        }
        if !target.nullable {
            apply = apply.rollback(format!(
                "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
                table.quoted(),
                column_ident.quoted()
            ));
        }
        if let Some(default) = &target.default_value {
            apply = apply.rollback(format!(
                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                table.quoted(),
                column_ident.quoted(),
                default
            ));
        }
        steps.push(apply);

        for dep in report.of_kind(DependencyKind::Index) {
            let DependencyDetail::Index { index } = &dep.detail else {
                continue;
            };
            let recreatable = !index.is_unique
                && !index.is_primary
                && index.expression.is_none()
                && index.predicate.is_none()
                && index.columns.len() > 1;
            if !recreatable {
                warnings.push(format!("Index {} is dropped and not recreated", index.name));
                continue;
            }
            let remaining: Vec<&String> = index.columns.iter().filter(|c| *c != column).collect();
            steps.push(
                ChangeStep::new(
                    StageKind::RecreateDependents,
                    "recreate_index",
                    format!("Recreate {} without {}", index.name, column),
                )
                .forward(format!(
                    "CREATE INDEX {} ON {} USING {} ({})",
                    quote_ident(&index.name),
                    table.quoted(),
                    index.index_type,
                    quote_column_list(&remaining)
                ))
                .rollback(format!(
                    "DROP INDEX IF EXISTS {}.{}",
                    quote_ident(&index.schema),
                    quote_ident(&index.name)
                )),
            );
        }

        steps.push(
            ChangeStep::new(
                StageKind::Validation,
                "validate_result",
                format!("Confirm {}.{} is gone and no rows were lost", table, column),
            )
            .verify(Verification::ColumnAbsent {
                table: table.clone(),
                column: column.to_string(),
            })
            .verify(Verification::RowCountUnchanged {
                table: table.clone(),
            }),
        );

        let plan = finish(
            ChangePlan {
                id,
                operation: OperationKind::RemoveColumn,
                table: table.clone(),
                target: column.to_string(),
                backup_strategy,
                backup_table: Some(backup_table),
                steps,
                dependencies: report,
                risk,
                fk_impact,
                warnings,
                dry_run: options.dry_run,
                created_at: Utc::now(),
            },
            options,
        );
        info!(
            "🧠 Planned removal of {}.{}: {} steps, {:?} backup, risk {}",
            table,
            column,
            plan.steps.len(),
            plan.backup_strategy,
            plan.risk.risk_level
        );
        Ok(plan)
    }

    // =========================================================================
    // TABLE RENAME
    // =========================================================================

    /// Plan `ALTER TABLE .. RENAME TO` with incoming foreign keys dropped and re-pointed
    pub async fn plan_table_rename(
        &self,
        table: &TableRef,
        new_name: &str,
        options: PlanOptions,
    ) -> GuardResult<ChangePlan> {
        info!("🧠 Planning rename of {} to {}", table, new_name);
        let new_ident =
            Ident::new(new_name).map_err(|e| planning_error(format!("invalid table name: {}", e)))?;
        let renamed = table.renamed(&new_ident);

        if !self.introspector.table_exists(table).await? {
            return Err(planning_error(format!("table {} does not exist", table)));
        }
        if self.introspector.table_exists(&renamed).await? {
            return Err(planning_error(format!("table {} already exists", renamed)));
        }

        let report = self.analyzer.analyze_table_dependencies(table).await?;
        let fk_impact = match self
            .fk_analyzer
            .analyze_foreign_key_impact(table, OperationKind::RenameTable)
            .await
        {
            Ok(impact) => Some(impact),
            Err(e) => {
                warn!("FK impact unavailable for {}: {}", table, e);
                None
            }
        };

        let mut operation = MigrationOperation::rename_table(table.clone(), new_name)
            .in_production(options.is_production)
            .with_backup(true)
            .with_rollback_sql(rename_sql(&renamed, &table.name));
        if let Ok(rows) = self.introspector.estimate_rows(table).await {
            operation = operation.with_estimated_rows(rows);
        }
        let risk = self
            .engine
            .calculate_migration_risk_score(&operation, &report, fk_impact.as_ref());

        let incoming: Vec<(&Dependency, &ForeignKeyInfo)> = report
            .of_kind(DependencyKind::ForeignKey)
            .iter()
            .filter_map(|dep| match dep.foreign_key() {
                Some((fk, FkDirection::Incoming)) => Some((dep, fk)),
                _ => None,
            })
            .collect();

        let mut steps = vec![ChangeStep::new(
            StageKind::ValidateTarget,
            "validate_target",
            format!("Confirm {} exists and {} is free", table, renamed),
        )
        .verify(Verification::TableExists {
            table: table.clone(),
        })
        .verify(Verification::TableAbsent {
            table: renamed.clone(),
        })];

        for (dep, fk) in &incoming {
            let source = fk_source(fk, table, table);
            steps.push(
                ChangeStep::new(
                    StageKind::DisableForeignKeys,
                    "drop_foreign_key",
                    format!("Drop {} on {}", fk.constraint_name, source),
                )
                .forward(drop_constraint_sql(&source, &fk.constraint_name))
                .rollback(add_foreign_key_sql(fk, &source, table))
                .risk(dep.impact),
            );
        }

        steps.push(
            ChangeStep::new(
                StageKind::ApplyChange,
                "rename_table",
                format!("Rename {} to {}", table, renamed),
            )
            .forward(rename_sql(table, &new_ident))
            .rollback(rename_sql(&renamed, &table.name))
            .risk(risk.risk_level),
        );

        for (dep, fk) in &incoming {
            let source = fk_source(fk, table, &renamed);
            steps.push(
                ChangeStep::new(
                    StageKind::EnableForeignKeys,
                    "recreate_foreign_key",
                    format!("Re-point {} at {}", fk.constraint_name, renamed),
                )
                .forward(add_foreign_key_sql(fk, &source, &renamed))
                .rollback(drop_constraint_sql(&source, &fk.constraint_name))
                .risk(dep.impact),
            );
        }

        steps.push(
            ChangeStep::new(
                StageKind::Validation,
                "validate_result",
                format!("Confirm {} replaced {}", renamed, table),
            )
            .verify(Verification::TableExists {
                table: renamed.clone(),
            })
            .verify(Verification::TableAbsent {
                table: table.clone(),
            })
            .verify(Verification::RowCountUnchanged { table: renamed }),
        );

        let warnings = report.warnings().to_vec();
        let repointed = incoming.len();
        let plan = finish(
            ChangePlan {
                id: Uuid::new_v4(),
                operation: OperationKind::RenameTable,
                table: table.clone(),
                target: new_name.to_string(),
                backup_strategy: BackupStrategy::NotRequired,
                backup_table: None,
                steps,
                dependencies: report,
                risk,
                fk_impact,
                warnings,
                dry_run: options.dry_run,
                created_at: Utc::now(),
            },
            options,
        );
        info!(
            "🧠 Planned rename of {}: {} steps, {} foreign keys re-pointed",
            table,
            plan.steps.len(),
            repointed
        );
        Ok(plan)
    }

    // =========================================================================
    // SAFETY GATE
    // =========================================================================

    /// Unsafe whenever a CRITICAL dependency exists or the plan itself scores CRITICAL
    pub fn validate_removal_safety(plan: &ChangePlan) -> SafetyReport {
        let blocking_dependencies: Vec<String> = plan
            .dependencies
            .critical()
            .iter()
            .map(|d| format!("{} ({})", d.qualified_name(), d.description))
            .collect();
        let risk_level = plan.risk.risk_level.max(plan.dependencies.max_impact());
        let is_safe = blocking_dependencies.is_empty() && !plan.risk.is_critical();

        let mut warnings = plan.warnings.clone();
        warnings.extend(
            plan.dependencies
                .at_least(RiskLevel::High)
                .iter()
                .filter(|d| d.impact == RiskLevel::High)
                .map(|d| format!("{}: {}", d.qualified_name(), d.description)),
        );
        if plan.risk.is_critical() {
            warnings.push(format!(
                "Overall risk score {:.2} is CRITICAL",
                plan.risk.overall_score
            ));
        }

        SafetyReport {
            is_safe,
            requires_confirmation: risk_level >= RiskLevel::High,
            risk_level,
            blocking_dependencies,
            warnings,
        }
    }
}

/// Mark every step of a dry-run plan
fn finish(mut plan: ChangePlan, options: PlanOptions) -> ChangePlan {
    if options.dry_run {
        for step in &mut plan.steps {
            step.dry_run = true;
        }
    }
    plan
}

// =============================================================================
// SQL BUILDERS
// =============================================================================

/// FKs, then views (deepest first), then triggers, then table constraints
fn drop_constraint_steps(
    table: &TableRef,
    report: &DependencyReport,
    warnings: &mut Vec<String>,
) -> Vec<ChangeStep> {
    let mut steps = Vec::new();

    for dep in report.of_kind(DependencyKind::ForeignKey) {
        let Some((fk, _)) = dep.foreign_key() else {
            continue;
        };
        let Ok(source) = fk.source() else {
            warnings.push(format!("Skipping foreign key {} with an invalid name", fk.constraint_name));
            continue;
        };
        let Ok(referenced) = fk.referenced() else {
            continue;
        };
        steps.push(
            ChangeStep::new(
                StageKind::DropConstraints,
                "drop_foreign_key",
                format!("Drop foreign key {} on {}", fk.constraint_name, source),
            )
            .forward(drop_constraint_sql(&source, &fk.constraint_name))
            .rollback(add_foreign_key_sql(fk, &source, &referenced))
            .risk(dep.impact),
        );
        warnings.push(format!(
            "Foreign key {} is dropped and not recreated",
            fk.constraint_name
        ));
    }

    let mut views: Vec<(u32, &Dependency)> = report
        .of_kind(DependencyKind::View)
        .iter()
        .filter_map(|dep| match &dep.detail {
            DependencyDetail::View { depth, .. } => Some((*depth, dep)),
            _ => None,
        })
        .collect();
    views.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, dep) in views {
        let DependencyDetail::View { view, .. } = &dep.detail else {
            continue;
        };
        let kind = if view.is_materialized {
            "MATERIALIZED VIEW"
        } else {
            "VIEW"
        };
        let name = format!("{}.{}", quote_ident(&view.schema), quote_ident(&view.name));
        let definition = view.definition.trim().trim_end_matches(';');
        steps.push(
            ChangeStep::new(
                StageKind::DropConstraints,
                "drop_view",
                format!("Drop {} {}", kind.to_lowercase(), view.name),
            )
            .forward(format!("DROP {} IF EXISTS {}", kind, name))
            .rollback(format!("CREATE {} {} AS {}", kind, name, definition))
            .risk(dep.impact),
        );
        warnings.push(format!("View {} is dropped and not recreated", view.name));
    }

    for dep in report.of_kind(DependencyKind::Trigger) {
        let DependencyDetail::Trigger { trigger } = &dep.detail else {
            continue;
        };
        steps.push(
            ChangeStep::new(
                StageKind::DropConstraints,
                "drop_trigger",
                format!("Drop trigger {}", trigger.name),
            )
            .forward(format!(
                "DROP TRIGGER IF EXISTS {} ON {}",
                quote_ident(&trigger.name),
                table.quoted()
            ))
            .rollback(trigger.definition.clone())
            .risk(dep.impact),
        );
    }

    for dep in report.of_kind(DependencyKind::Constraint) {
        let DependencyDetail::Constraint { constraint } = &dep.detail else {
            continue;
        };
        steps.push(
            ChangeStep::new(
                StageKind::DropConstraints,
                "drop_constraint",
                format!("Drop constraint {}", constraint.name),
            )
            .forward(drop_constraint_sql(table, &constraint.name))
            .rollback(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                table.quoted(),
                quote_ident(&constraint.name),
                constraint.definition
            ))
            .risk(dep.impact),
        );
    }

    steps
}

fn add_column_sql(table: &TableRef, column: &ColumnInfo) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table.quoted(),
        quote_ident(&column.name),
        column.data_type
    )
}

/// Copy the dropped column back from the backup table
fn restore_data_sql(
    table: &TableRef,
    column: &Ident,
    backup: &TableRef,
    strategy: BackupStrategy,
    primary_key: &[String],
    columns: &[ColumnInfo],
) -> Vec<String> {
    let joinable = !primary_key.is_empty() && !primary_key.iter().any(|c| c == column.as_str());
    if joinable {
        let on = primary_key
            .iter()
            .map(|c| format!("t.{0} = b.{0}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        return vec![format!(
            "UPDATE {} AS t SET {} = b.{} FROM {} AS b WHERE {}",
            table.quoted(),
            column.quoted(),
            column.quoted(),
            backup.quoted(),
            on
        )];
    }

    // No usable key: rewrite the table from the full snapshot
    if strategy == BackupStrategy::TableSnapshot {
        let all: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let list = quote_column_list(&all);
        return vec![
            format!("DELETE FROM {}", table.quoted()),
            format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                table.quoted(),
                list,
                list,
                backup.quoted()
            ),
        ];
    }
    Vec::new()
}

fn drop_constraint_sql(table: &TableRef, name: &str) -> String {
    format!(
        "ALTER TABLE {} DROP CONSTRAINT {}",
        table.quoted(),
        quote_ident(name)
    )
}

fn add_foreign_key_sql(fk: &ForeignKeyInfo, source: &TableRef, referenced: &TableRef) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
        source.quoted(),
        quote_ident(&fk.constraint_name),
        quote_column_list(&fk.source_columns),
        referenced.quoted(),
        quote_column_list(&fk.referenced_columns),
        fk.on_delete.as_sql(),
        fk.on_update.as_sql()
    )
}

fn rename_sql(table: &TableRef, new_name: &Ident) -> String {
    format!("ALTER TABLE {} RENAME TO {}", table.quoted(), new_name.quoted())
}

/// Referencing table of an incoming FK; a self-reference follows the table being renamed
fn fk_source(fk: &ForeignKeyInfo, original: &TableRef, current: &TableRef) -> TableRef {
    if fk.source_schema == original.schema.as_str() && fk.source_table == original.name.as_str() {
        return current.clone();
    }
    fk.source().unwrap_or_else(|_| current.clone())
}
