//! Scoring rules
//!
//! Every category is built from additive factors, clamped to 0..=100, then combined with the
//! configured weights. Inputs are borrowed and nothing is cached, so the engine is `Sync` and
//! deterministic.

use super::{
    ComprehensiveRiskAssessment, Recommendation, RecommendationPriority, RiskCategory,
    RiskFactor, RiskLevel,
};
use crate::analysis::{DependencyKind, DependencyReport, FkImpactReport};
use crate::config::RiskWeights;
use crate::error::GuardResult;
use crate::operation::{MigrationOperation, OperationKind};
use std::collections::BTreeMap;
use tracing::debug;

const PRODUCTION_MULTIPLIER: f64 = 1.2;
const NO_BACKUP_MULTIPLIER: f64 = 1.3;
const CASCADE_WITH_ROWS_POINTS: f64 = 50.0;
const CRITICAL_FK_POINTS: f64 = 15.0;
const CRITICAL_FK_CAP: usize = 4;

/// Pure risk model
#[derive(Debug, Clone)]
pub struct RiskAssessmentEngine {
    weights: RiskWeights,
}

impl Default for RiskAssessmentEngine {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
        }
    }
}

impl RiskAssessmentEngine {
    pub fn new(weights: RiskWeights) -> GuardResult<Self> {
        Ok(Self {
            weights: weights.normalized()?,
        })
    }

    pub fn weights(&self) -> &RiskWeights {
        &self.weights
    }

    /// Score `operation` against its dependency report
    ///
    /// `fk_impact` refines CASCADE handling with live row counts; without it every CASCADE
    /// reference is assumed to have dependent rows.
    pub fn calculate_migration_risk_score(
        &self,
        operation: &MigrationOperation,
        report: &DependencyReport,
        fk_impact: Option<&FkImpactReport>,
    ) -> ComprehensiveRiskAssessment {
        let ctx = Context::new(operation, report, fk_impact);
        let mut factors = Vec::new();

        let data_loss = data_loss_score(&ctx, &mut factors);
        let availability = availability_score(&ctx, &mut factors);
        let performance = performance_score(&ctx, &mut factors);
        let rollback = rollback_score(&ctx, &mut factors);

        let mut category_scores = BTreeMap::new();
        category_scores.insert(RiskCategory::DataLoss, round2(data_loss));
        category_scores.insert(RiskCategory::SystemAvailability, round2(availability));
        category_scores.insert(RiskCategory::PerformanceDegradation, round2(performance));
        category_scores.insert(RiskCategory::RollbackComplexity, round2(rollback));

        let overall_score = round2(
            RiskCategory::ALL
                .iter()
                .map(|c| category_scores[c] * c.weight(&self.weights))
                .sum::<f64>()
                .clamp(0.0, 100.0),
        );

        let mut risk_level = RiskLevel::from_score(overall_score);
        // Live rows behind a CASCADE key are never below HIGH, whatever the weights
        if ctx.cascade_with_rows && operation.kind.is_destructive() {
            risk_level = risk_level.max(RiskLevel::High);
        }

        let recommendations = recommend(&ctx, &category_scores, risk_level);

        debug!(
            "Risk for {} {}: score={:.2} level={} factors={}",
            operation.kind,
            operation.target_path(),
            overall_score,
            risk_level,
            factors.len()
        );

        ComprehensiveRiskAssessment {
            operation: operation.kind,
            target: operation.target_path(),
            overall_score,
            risk_level,
            category_scores,
            risk_factors: factors,
            recommendations,
            weights: self.weights,
        }
    }
}

/// Facts derived once from the inputs
struct Context<'a> {
    operation: &'a MigrationOperation,
    report: &'a DependencyReport,
    critical_fks: usize,
    cascade_present: bool,
    cascade_with_rows: bool,
}

impl<'a> Context<'a> {
    fn new(
        operation: &'a MigrationOperation,
        report: &'a DependencyReport,
        fk_impact: Option<&FkImpactReport>,
    ) -> Self {
        let report_critical = report
            .of_kind(DependencyKind::ForeignKey)
            .iter()
            .filter(|d| d.impact == RiskLevel::Critical)
            .count();
        let impact_critical = fk_impact.map_or(0, FkImpactReport::critical_count);

        let cascade_in_report = report.has_cascading_reference();
        let cascade_with_rows = match fk_impact {
            Some(impact) => impact.has_cascade_with_rows(),
            None => cascade_in_report,
        };

        Self {
            operation,
            report,
            critical_fks: report_critical.max(impact_critical),
            cascade_present: cascade_in_report || cascade_with_rows,
            cascade_with_rows,
        }
    }
}

fn factor(
    factors: &mut Vec<RiskFactor>,
    category: RiskCategory,
    code: &str,
    severity: RiskLevel,
    score_impact: f64,
    description: String,
) -> f64 {
    factors.push(RiskFactor {
        code: code.to_string(),
        category,
        description,
        severity,
        score_impact,
    });
    score_impact
}

fn data_loss_score(ctx: &Context, factors: &mut Vec<RiskFactor>) -> f64 {
    let cat = RiskCategory::DataLoss;
    let op = ctx.operation;
    let mut score = 0.0;

    let base = match op.kind {
        OperationKind::DropTable => 45.0,
        OperationKind::RemoveColumn => 30.0,
        OperationKind::AlterColumnType => 15.0,
        OperationKind::RenameTable | OperationKind::RenameColumn => 0.0,
    };
    if base > 0.0 {
        score += factor(
            factors,
            cat,
            "DESTRUCTIVE_OPERATION",
            RiskLevel::Medium,
            base,
            format!("{} discards stored data on {}", op.kind, op.target_path()),
        );
    }

    if ctx.critical_fks > 0 {
        let points = if op.kind.is_destructive() {
            CRITICAL_FK_POINTS * ctx.critical_fks.min(CRITICAL_FK_CAP) as f64
        } else {
            5.0 * ctx.critical_fks as f64
        };
        score += factor(
            factors,
            cat,
            "CRITICAL_FOREIGN_KEYS",
            RiskLevel::Critical,
            points,
            format!(
                "{} foreign key(s) would orphan or reject rows",
                ctx.critical_fks
            ),
        );
    }

    if ctx.cascade_with_rows && op.kind.is_destructive() {
        score += factor(
            factors,
            cat,
            "CASCADE_WITH_ROWS",
            RiskLevel::Critical,
            CASCADE_WITH_ROWS_POINTS,
            "ON DELETE CASCADE references with live dependent rows".to_string(),
        );
    }

    if op.is_production && score > 0.0 {
        factor(
            factors,
            cat,
            "PRODUCTION_TARGET",
            RiskLevel::High,
            score * (PRODUCTION_MULTIPLIER - 1.0),
            "Target is a production database".to_string(),
        );
        score *= PRODUCTION_MULTIPLIER;
    }

    if !op.has_backup && score > 0.0 {
        factor(
            factors,
            cat,
            "NO_BACKUP",
            RiskLevel::High,
            score * (NO_BACKUP_MULTIPLIER - 1.0),
            "No backup exists for the affected data".to_string(),
        );
        score *= NO_BACKUP_MULTIPLIER;
    }

    score.clamp(0.0, 100.0)
}

fn impact_points(level: RiskLevel) -> f64 {
    match level {
        RiskLevel::Low => 5.0,
        RiskLevel::Medium => 10.0,
        RiskLevel::High => 20.0,
        RiskLevel::Critical => 30.0,
    }
}

fn availability_score(ctx: &Context, factors: &mut Vec<RiskFactor>) -> f64 {
    let cat = RiskCategory::SystemAvailability;
    let mut score = 0.0;

    for (kind, code, label) in [
        (DependencyKind::View, "DEPENDENT_VIEWS", "view"),
        (DependencyKind::Trigger, "DEPENDENT_TRIGGERS", "trigger"),
    ] {
        let deps = ctx.report.of_kind(kind);
        if deps.is_empty() {
            continue;
        }
        let points: f64 = deps.iter().map(|d| impact_points(d.impact)).sum();
        let worst = deps.iter().map(|d| d.impact).max().unwrap_or_default();
        score += factor(
            factors,
            cat,
            code,
            worst,
            points,
            format!(
                "{} dependent {}(s) must be dropped and recreated: {}",
                deps.len(),
                label,
                deps.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", ")
            ),
        );
    }

    let fks = ctx.report.of_kind(DependencyKind::ForeignKey);
    if !fks.is_empty() {
        score += factor(
            factors,
            cat,
            "FOREIGN_KEY_CHANGES",
            RiskLevel::Medium,
            5.0 * fks.len() as f64,
            format!("{} foreign key(s) change during the migration", fks.len()),
        );
    }

    score.clamp(0.0, 100.0)
}

fn performance_score(ctx: &Context, factors: &mut Vec<RiskFactor>) -> f64 {
    let cat = RiskCategory::PerformanceDegradation;
    let mut score = 0.0;

    let indexes = ctx.report.of_kind(DependencyKind::Index);
    if !indexes.is_empty() {
        let points: f64 = indexes
            .iter()
            .map(|d| if d.is_unique() == Some(true) { 20.0 } else { 10.0 })
            .sum();
        score += factor(
            factors,
            cat,
            "DEPENDENT_INDEXES",
            RiskLevel::Medium,
            points,
            format!("{} index(es) are dropped or rebuilt", indexes.len()),
        );
    }

    if let Some(rows) = ctx.operation.estimated_rows {
        let (points, severity) = match rows {
            r if r < 10_000 => (0.0, RiskLevel::Low),
            r if r < 1_000_000 => (15.0, RiskLevel::Medium),
            r if r < 10_000_000 => (30.0, RiskLevel::High),
            _ => (45.0, RiskLevel::Critical),
        };
        if points > 0.0 {
            score += factor(
                factors,
                cat,
                "LARGE_TABLE",
                severity,
                points,
                format!("{} has about {} rows", ctx.operation.table, rows),
            );
        }
    }

    score.clamp(0.0, 100.0)
}

fn rollback_score(ctx: &Context, factors: &mut Vec<RiskFactor>) -> f64 {
    let cat = RiskCategory::RollbackComplexity;
    let op = ctx.operation;
    let mut score = 0.0;

    if !op.has_backup {
        score += factor(
            factors,
            cat,
            "NO_BACKUP_FOR_ROLLBACK",
            RiskLevel::High,
            35.0,
            "Rollback cannot restore data without a backup".to_string(),
        );
    }

    if ctx.cascade_present {
        score += factor(
            factors,
            cat,
            "CASCADE_PRESENT",
            RiskLevel::High,
            40.0,
            "Cascaded deletes cannot be undone by reversing DDL".to_string(),
        );
    }

    if is_trivial_rollback(op.rollback_sql.as_deref()) {
        score += factor(
            factors,
            cat,
            "TRIVIAL_ROLLBACK",
            RiskLevel::Medium,
            25.0,
            "Rollback SQL is empty or does nothing".to_string(),
        );
    }

    if op.kind.is_destructive() {
        score += factor(
            factors,
            cat,
            "IRREVERSIBLE_DDL",
            RiskLevel::Medium,
            25.0,
            format!("{} cannot be reversed by DDL alone", op.kind),
        );
    }

    score.clamp(0.0, 100.0)
}

/// Blank, comment-only, or a statement that changes nothing
pub(crate) fn is_trivial_rollback(sql: Option<&str>) -> bool {
    let Some(sql) = sql else {
        return true;
    };

    let meaningful: Vec<String> = split_statements(sql)
        .iter()
        .map(|stmt| stmt.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase())
        .filter(|stmt| !stmt.is_empty())
        .filter(|stmt| {
            !matches!(
                stmt.as_str(),
                "SELECT 1" | "BEGIN" | "COMMIT" | "ROLLBACK" | "START TRANSACTION" | "END"
            )
        })
        .collect();

    meaningful.is_empty()
}

/// Split on `;` with comments removed; quoted literals and identifiers are kept whole
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                current.push(c);
                // a doubled quote closes and reopens, which keeps the text intact
                for inner in chars.by_ref() {
                    current.push(inner);
                    if inner == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        break;
                    }
                }
                current.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for skipped in chars.by_ref() {
                    if previous == '*' && skipped == '/' {
                        break;
                    }
                    previous = skipped;
                }
                current.push(' ');
            }
            ';' => statements.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    statements.push(current);
    statements
}

fn recommend(
    ctx: &Context,
    scores: &BTreeMap<RiskCategory, f64>,
    level: RiskLevel,
) -> Vec<Recommendation> {
    let mut recs = Vec::new();
    let op = ctx.operation;
    let score = |c: RiskCategory| scores.get(&c).copied().unwrap_or(0.0);

    if RiskLevel::from_score(score(RiskCategory::DataLoss)) == RiskLevel::Critical {
        recs.push(Recommendation {
            priority: RecommendationPriority::Required,
            title: "Do not proceed without backup and approval".to_string(),
            description: format!(
                "Data loss risk on {} is critical. Take a verified backup and get explicit \
                 sign-off before running this change.",
                op.target_path()
            ),
            action: Some("Re-run with a verified backup and an explicit safety override".to_string()),
        });
    }

    if !op.has_backup && op.kind.is_destructive() {
        recs.push(Recommendation {
            priority: RecommendationPriority::Required,
            title: "Create a backup first".to_string(),
            description: "No backup exists for the data this change removes.".to_string(),
            action: Some(format!(
                "CREATE TABLE ... AS SELECT * FROM {}",
                op.table.quoted()
            )),
        });
    }

    if ctx.cascade_present && op.kind.is_destructive() {
        let names: Vec<&str> = ctx
            .report
            .of_kind(DependencyKind::ForeignKey)
            .iter()
            .filter(|d| d.is_cascading_reference())
            .map(|d| d.name.as_str())
            .collect();
        recs.push(Recommendation {
            priority: RecommendationPriority::Required,
            title: "Resolve ON DELETE CASCADE references".to_string(),
            description: format!(
                "Cascading foreign keys ({}) can silently delete dependent rows.",
                if names.is_empty() { "see FK impact".to_string() } else { names.join(", ") }
            ),
            action: Some("Drop or re-point the cascading foreign keys before the change".to_string()),
        });
    }

    if is_trivial_rollback(op.rollback_sql.as_deref()) {
        recs.push(Recommendation {
            priority: RecommendationPriority::Required,
            title: "Provide rollback SQL".to_string(),
            description: "The rollback is empty or a no-op.".to_string(),
            action: None,
        });
    }

    if score(RiskCategory::SystemAvailability) >= 35.0 {
        recs.push(Recommendation {
            priority: RecommendationPriority::Recommended,
            title: "Plan for dependent object downtime".to_string(),
            description: "Views and triggers on the target are dropped and recreated; \
                          queries against them fail in between."
                .to_string(),
            action: None,
        });
    }

    if score(RiskCategory::PerformanceDegradation) >= 35.0 {
        recs.push(Recommendation {
            priority: RecommendationPriority::Recommended,
            title: "Schedule during off-peak hours".to_string(),
            description: "Index rebuilds and table size make lock time significant.".to_string(),
            action: None,
        });
    }

    if score(RiskCategory::RollbackComplexity) >= 70.0 {
        recs.push(Recommendation {
            priority: RecommendationPriority::Recommended,
            title: "Rehearse the rollback on staging".to_string(),
            description: "Rollback is complex; validate it before touching production.".to_string(),
            action: Some("schemaflow-guard validate".to_string()),
        });
    }

    if recs.is_empty() && level == RiskLevel::Low {
        recs.push(Recommendation {
            priority: RecommendationPriority::Optional,
            title: "Safe to proceed".to_string(),
            description: "No significant risk factors found.".to_string(),
            action: None,
        });
    }

    recs
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
