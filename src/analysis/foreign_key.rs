//! Foreign Key Impact Analyzer
//!
//! Looks at incoming foreign keys through their delete action and the number of rows that
//! currently depend on the target, which the plain dependency report does not know.

use crate::error::{GuardError, GuardResult};
use crate::introspection::{ForeignKeyInfo, ReferentialAction, SchemaIntrospector};
use crate::operation::OperationKind;
use crate::risk::RiskLevel;
use crate::sql::TableRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Impact of one incoming foreign key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FkImpact {
    pub constraint_name: String,
    /// schema.table holding the referencing rows
    pub referencing_table: String,
    pub referencing_columns: Vec<String>,
    pub referenced_columns: Vec<String>,
    pub on_delete: ReferentialAction,
    /// None when the count could not be taken
    pub dependent_rows: Option<i64>,
    pub impact: RiskLevel,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FkImpactReport {
    pub table: TableRef,
    pub operation: OperationKind,
    pub impacts: Vec<FkImpact>,
    pub analyzed_at: DateTime<Utc>,
}

impl FkImpactReport {
    pub fn max_impact(&self) -> RiskLevel {
        self.impacts
            .iter()
            .map(|i| i.impact)
            .max()
            .unwrap_or(RiskLevel::Low)
    }

    pub fn critical_count(&self) -> usize {
        self.impacts
            .iter()
            .filter(|i| i.impact == RiskLevel::Critical)
            .count()
    }

    /// A CASCADE key with rows behind it (unknown counts are assumed non-empty)
    pub fn has_cascade_with_rows(&self) -> bool {
        self.impacts.iter().any(|i| {
            i.on_delete == ReferentialAction::Cascade && i.dependent_rows.map_or(true, |n| n > 0)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.impacts.is_empty()
    }
}

pub struct ForeignKeyImpactAnalyzer {
    introspector: Arc<dyn SchemaIntrospector>,
}

impl ForeignKeyImpactAnalyzer {
    pub fn new(introspector: Arc<dyn SchemaIntrospector>) -> Self {
        Self { introspector }
    }

    /// Impact of every incoming foreign key on `table`
    pub async fn analyze_foreign_key_impact(
        &self,
        table: &TableRef,
        operation: OperationKind,
    ) -> GuardResult<FkImpactReport> {
        self.analyze(table, None, operation).await
    }

    /// Impact of incoming foreign keys that include `column` among their referenced columns
    pub async fn analyze_column_foreign_key_impact(
        &self,
        table: &TableRef,
        column: &str,
        operation: OperationKind,
    ) -> GuardResult<FkImpactReport> {
        self.analyze(table, Some(column), operation).await
    }

    async fn analyze(
        &self,
        table: &TableRef,
        column: Option<&str>,
        operation: OperationKind,
    ) -> GuardResult<FkImpactReport> {
        info!("🔗 Analyzing foreign key impact of {} on {}", operation, table);

        let foreign_keys = match self.introspector.list_foreign_keys(table).await {
            Ok(fks) => fks,
            Err(GuardError::SchemaNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut impacts = Vec::new();
        for fk in foreign_keys.into_iter().filter(|fk| references(fk, table, column)) {
            let dependent_rows = self.count_dependent_rows(&fk).await;
            let impact = Self::classify(fk.on_delete, dependent_rows, operation);
            let explanation = explain(&fk, dependent_rows, operation, impact);
            impacts.push(FkImpact {
                constraint_name: fk.constraint_name,
                referencing_table: format!("{}.{}", fk.source_schema, fk.source_table),
                referencing_columns: fk.source_columns,
                referenced_columns: fk.referenced_columns,
                on_delete: fk.on_delete,
                dependent_rows,
                impact,
                explanation,
            });
        }
        impacts.sort_by(|a, b| a.constraint_name.cmp(&b.constraint_name));

        Ok(FkImpactReport {
            table: table.clone(),
            operation,
            impacts,
            analyzed_at: Utc::now(),
        })
    }

    /// Delete action + live rows → impact
    ///
    /// Renames leave data untouched, so every key is MEDIUM: it only has to be re-pointed.
    pub fn classify(
        on_delete: ReferentialAction,
        dependent_rows: Option<i64>,
        operation: OperationKind,
    ) -> RiskLevel {
        if !operation.is_destructive() {
            return RiskLevel::Medium;
        }

        match on_delete {
            ReferentialAction::Cascade => match dependent_rows {
                Some(0) => RiskLevel::Medium,
                _ => RiskLevel::Critical,
            },
            ReferentialAction::Restrict | ReferentialAction::NoAction => RiskLevel::Critical,
            ReferentialAction::SetNull | ReferentialAction::SetDefault => RiskLevel::High,
        }
    }

    async fn count_dependent_rows(&self, fk: &ForeignKeyInfo) -> Option<i64> {
        let source = fk.source().ok()?;
        match self
            .introspector
            .count_referencing_rows(&source, &fk.source_columns)
            .await
        {
            Ok(n) => Some(n),
            Err(e) => {
                warn!("Could not count rows of {}: {}", source, e);
                None
            }
        }
    }
}

fn references(fk: &ForeignKeyInfo, table: &TableRef, column: Option<&str>) -> bool {
    let incoming = fk.referenced_schema == table.schema.as_str()
        && fk.referenced_table == table.name.as_str();
    match column {
        Some(column) => incoming && fk.referenced_columns.iter().any(|c| c == column),
        None => incoming,
    }
}

fn explain(
    fk: &ForeignKeyInfo,
    dependent_rows: Option<i64>,
    operation: OperationKind,
    impact: RiskLevel,
) -> String {
    let rows = dependent_rows
        .map(|n| format!("{} rows", n))
        .unwrap_or_else(|| "an unknown number of rows".to_string());

    if !operation.is_destructive() {
        return format!(
            "{} on {}.{} must be re-pointed after the {}",
            fk.constraint_name, fk.source_schema, fk.source_table, operation
        );
    }

    match fk.on_delete {
        ReferentialAction::Cascade if impact == RiskLevel::Critical => format!(
            "ON DELETE CASCADE from {}.{} covers {}; removing referenced data deletes them",
            fk.source_schema, fk.source_table, rows
        ),
        ReferentialAction::Cascade => format!(
            "ON DELETE CASCADE from {}.{} currently has no dependent rows",
            fk.source_schema, fk.source_table
        ),
        ReferentialAction::Restrict | ReferentialAction::NoAction => format!(
            "{} ({}) blocks the change until the foreign key is removed; {} reference it",
            fk.constraint_name, fk.on_delete, rows
        ),
        ReferentialAction::SetNull | ReferentialAction::SetDefault => format!(
            "{} would {} on {} in {}.{}",
            fk.constraint_name,
            fk.on_delete,
            rows,
            fk.source_schema,
            fk.source_table
        ),
    }
}
