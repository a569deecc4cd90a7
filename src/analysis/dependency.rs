//! Dependency Analyzer
//!
//! "What depends on this column?"
//! Enumerates every foreign key, view, trigger, index and constraint that references a
//! column (or a whole table) and classifies each one by impact level.

use crate::analysis::references::{any_mentions, mentions_identifier};
use crate::error::{GuardError, GuardResult};
use crate::introspection::{
    ConstraintInfo, ConstraintKind, ForeignKeyInfo, IndexInfo, ReferentialAction,
    SchemaIntrospector, TriggerInfo, ViewInfo,
};
use crate::risk::RiskLevel;
use crate::sql::{Ident, TableRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How far view-on-view discovery walks
pub const MAX_VIEW_DEPTH: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    ForeignKey,
    View,
    Trigger,
    Index,
    Constraint,
}

/// How a dependency was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detection {
    /// Recorded by the catalog
    Exact,
    /// Text scan or transitive walk; may over-report
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FkDirection {
    /// Another table (or this one) references the target
    Incoming,
    /// The target is part of a key referencing another table
    Outgoing,
}

/// Catalog object behind a dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DependencyDetail {
    ForeignKey {
        direction: FkDirection,
        foreign_key: ForeignKeyInfo,
    },
    View {
        view: ViewInfo,
        /// 1 for views reading the table directly
        depth: u32,
    },
    Trigger {
        trigger: TriggerInfo,
    },
    Index {
        index: IndexInfo,
    },
    Constraint {
        constraint: ConstraintInfo,
    },
}

/// One object that relies on the analyzed target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,
    pub schema: String,
    pub impact: RiskLevel,
    pub detection: Detection,
    pub description: String,
    pub detail: DependencyDetail,
}

impl Dependency {
    pub fn kind(&self) -> DependencyKind {
        match self.detail {
            DependencyDetail::ForeignKey { .. } => DependencyKind::ForeignKey,
            DependencyDetail::View { .. } => DependencyKind::View,
            DependencyDetail::Trigger { .. } => DependencyKind::Trigger,
            DependencyDetail::Index { .. } => DependencyKind::Index,
            DependencyDetail::Constraint { .. } => DependencyKind::Constraint,
        }
    }

    pub fn foreign_key(&self) -> Option<(&ForeignKeyInfo, FkDirection)> {
        match &self.detail {
            DependencyDetail::ForeignKey {
                foreign_key,
                direction,
            } => Some((foreign_key, *direction)),
            _ => None,
        }
    }

    /// For FKs, the table on the other end of the relationship
    pub fn target_table(&self) -> Option<String> {
        self.foreign_key().map(|(fk, direction)| match direction {
            FkDirection::Incoming => format!("{}.{}", fk.source_schema, fk.source_table),
            FkDirection::Outgoing => {
                format!("{}.{}", fk.referenced_schema, fk.referenced_table)
            }
        })
    }

    pub fn on_delete(&self) -> Option<ReferentialAction> {
        self.foreign_key().map(|(fk, _)| fk.on_delete)
    }

    pub fn is_unique(&self) -> Option<bool> {
        match &self.detail {
            DependencyDetail::Index { index } => Some(index.is_unique || index.is_primary),
            DependencyDetail::Constraint { constraint } => Some(matches!(
                constraint.kind,
                ConstraintKind::PrimaryKey | ConstraintKind::Unique
            )),
            _ => None,
        }
    }

    pub fn is_materialized(&self) -> Option<bool> {
        match &self.detail {
            DependencyDetail::View { view, .. } => Some(view.is_materialized),
            _ => None,
        }
    }

    /// Incoming FK whose delete action cascades
    pub fn is_cascading_reference(&self) -> bool {
        matches!(
            self.foreign_key(),
            Some((fk, FkDirection::Incoming)) if fk.on_delete == ReferentialAction::Cascade
        )
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Everything that depends on one table or column
///
/// Built once per analysis call and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReport {
    table: TableRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    column: Option<String>,
    target_found: bool,
    dependencies: BTreeMap<DependencyKind, Vec<Dependency>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    analyzed_at: DateTime<Utc>,
}

impl DependencyReport {
    /// Report for an existing target, grouping dependencies by kind
    pub fn new(table: TableRef, column: Option<String>, dependencies: Vec<Dependency>) -> Self {
        let mut grouped: BTreeMap<DependencyKind, Vec<Dependency>> = BTreeMap::new();
        for dep in dependencies {
            grouped.entry(dep.kind()).or_default().push(dep);
        }
        for deps in grouped.values_mut() {
            deps.sort_by(|a, b| a.qualified_name().cmp(&b.qualified_name()));
        }

        Self {
            table,
            column,
            target_found: true,
            dependencies: grouped,
            warnings: Vec::new(),
            analyzed_at: Utc::now(),
        }
    }

    /// Empty report for a target that does not exist
    pub fn not_found(table: TableRef, column: Option<String>, warning: impl Into<String>) -> Self {
        Self {
            target_found: false,
            warnings: vec![warning.into()],
            ..Self::new(table, column, Vec::new())
        }
    }

    fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn target_found(&self) -> bool {
        self.target_found
    }

    pub fn dependencies(&self) -> &BTreeMap<DependencyKind, Vec<Dependency>> {
        &self.dependencies
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn analyzed_at(&self) -> DateTime<Utc> {
        self.analyzed_at
    }

    pub fn of_kind(&self, kind: DependencyKind) -> &[Dependency] {
        self.dependencies
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.values().flatten()
    }

    pub fn count(&self) -> usize {
        self.dependencies.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Highest impact across all dependencies; LOW when there are none
    pub fn max_impact(&self) -> RiskLevel {
        self.all()
            .map(|d| d.impact)
            .max()
            .unwrap_or(RiskLevel::Low)
    }

    pub fn critical(&self) -> Vec<&Dependency> {
        self.at_least(RiskLevel::Critical)
    }

    pub fn at_least(&self, level: RiskLevel) -> Vec<&Dependency> {
        self.all().filter(|d| d.impact >= level).collect()
    }

    pub fn has_cascading_reference(&self) -> bool {
        self.all().any(Dependency::is_cascading_reference)
    }
}

/// Read-only dependency discovery over a `SchemaIntrospector`
pub struct DependencyAnalyzer {
    introspector: Arc<dyn SchemaIntrospector>,
}

impl DependencyAnalyzer {
    pub fn new(introspector: Arc<dyn SchemaIntrospector>) -> Self {
        Self { introspector }
    }

    /// Everything that references `table.column`
    ///
    /// A missing table or column yields an empty report with `target_found = false`.
    /// Catalog failures other than "not found" are returned as errors: an unreadable catalog
    /// must never look like a dependency-free target.
    pub async fn analyze_column_dependencies(
        &self,
        table: &TableRef,
        column: &str,
    ) -> GuardResult<DependencyReport> {
        info!("🔍 Analyzing dependencies of {}.{}", table, column);
        let column_label = Some(column.to_string());

        if let Err(e) = Ident::new(column) {
            warn!("Rejected column identifier for {}: {}", table, e);
            return Ok(DependencyReport::not_found(
                table.clone(),
                column_label,
                format!("Column identifier rejected: {}", e),
            ));
        }

        if !tolerate_missing(self.introspector.table_exists(table).await)? {
            debug!("Table {} not found; reporting no dependencies", table);
            return Ok(DependencyReport::not_found(
                table.clone(),
                column_label,
                format!("Table {} not found", table),
            ));
        }

        if !tolerate_missing(self.introspector.column_exists(table, column).await)? {
            debug!("Column {}.{} not found; reporting no dependencies", table, column);
            return Ok(DependencyReport::not_found(
                table.clone(),
                column_label,
                format!("Column {}.{} not found", table, column),
            ));
        }

        let mut warnings = Vec::new();
        let mut dependencies = Vec::new();

        let foreign_keys = tolerate_missing(self.introspector.list_foreign_keys(table).await)?;
        dependencies.extend(
            foreign_keys
                .into_iter()
                .filter_map(|fk| classify_column_foreign_key(fk, table, column)),
        );

        let views = tolerate_missing(self.introspector.list_views(table).await)?;
        let direct_views: Vec<(ViewInfo, Detection)> = views
            .into_iter()
            .filter_map(|view| {
                let (matched, detection) = match &view.referenced_columns {
                    Some(columns) => (columns.iter().any(|c| c == column), Detection::Exact),
                    None => (
                        mentions_identifier(&view.definition, column),
                        Detection::BestEffort,
                    ),
                };
                matched.then_some((view, detection))
            })
            .collect();
        dependencies.extend(self.expand_views(direct_views, &mut warnings).await);

        let triggers = tolerate_missing(self.introspector.list_triggers(table).await)?;
        dependencies.extend(
            triggers
                .into_iter()
                .filter_map(|trigger| classify_column_trigger(trigger, column)),
        );

        let indexes = tolerate_missing(self.introspector.list_indexes(table).await)?;
        dependencies.extend(
            indexes
                .into_iter()
                .filter_map(|index| classify_column_index(index, column)),
        );

        let constraints = tolerate_missing(self.introspector.list_constraints(table).await)?;
        dependencies.extend(
            constraints
                .into_iter()
                .filter_map(|constraint| classify_column_constraint(constraint, column)),
        );

        let report = DependencyReport::new(table.clone(), column_label, dependencies)
            .with_warnings(warnings);

        info!(
            "🔍 {}.{}: {} dependencies, max impact {}",
            table,
            column,
            report.count(),
            report.max_impact()
        );
        Ok(report)
    }

    /// Everything that references the table as a whole
    ///
    /// Incoming FKs are HIGH (they must be re-pointed), outgoing FKs and objects that travel
    /// with the table are LOW.
    pub async fn analyze_table_dependencies(
        &self,
        table: &TableRef,
    ) -> GuardResult<DependencyReport> {
        info!("🔍 Analyzing dependencies of table {}", table);

        if !tolerate_missing(self.introspector.table_exists(table).await)? {
            return Ok(DependencyReport::not_found(
                table.clone(),
                None,
                format!("Table {} not found", table),
            ));
        }

        let mut warnings = Vec::new();
        let mut dependencies = Vec::new();

        for fk in tolerate_missing(self.introspector.list_foreign_keys(table).await)? {
            let incoming = fk.referenced_schema == table.schema.as_str()
                && fk.referenced_table == table.name.as_str();
            let (direction, impact, description) = if incoming {
                (
                    FkDirection::Incoming,
                    RiskLevel::High,
                    format!(
                        "{}.{} references {} via {} (ON DELETE {})",
                        fk.source_schema, fk.source_table, table, fk.constraint_name, fk.on_delete
                    ),
                )
            } else {
                (
                    FkDirection::Outgoing,
                    RiskLevel::Low,
                    format!(
                        "{} references {}.{} via {}",
                        table, fk.referenced_schema, fk.referenced_table, fk.constraint_name
                    ),
                )
            };
            dependencies.push(Dependency {
                name: fk.constraint_name.clone(),
                schema: fk.source_schema.clone(),
                impact,
                detection: Detection::Exact,
                description,
                detail: DependencyDetail::ForeignKey {
                    direction,
                    foreign_key: fk,
                },
            });
        }

        let views = tolerate_missing(self.introspector.list_views(table).await)?
            .into_iter()
            .map(|view| (view, Detection::Exact))
            .collect();
        dependencies.extend(self.expand_views(views, &mut warnings).await);

        for trigger in tolerate_missing(self.introspector.list_triggers(table).await)? {
            dependencies.push(Dependency {
                name: trigger.name.clone(),
                schema: trigger.schema.clone(),
                impact: RiskLevel::Low,
                detection: Detection::Exact,
                description: format!("Trigger {} runs {}", trigger.name, trigger.function_name),
                detail: DependencyDetail::Trigger { trigger },
            });
        }

        for index in tolerate_missing(self.introspector.list_indexes(table).await)? {
            dependencies.push(Dependency {
                name: index.name.clone(),
                schema: index.schema.clone(),
                impact: RiskLevel::Low,
                detection: Detection::Exact,
                description: format!("Index {} ({})", index.name, index.index_type),
                detail: DependencyDetail::Index { index },
            });
        }

        for constraint in tolerate_missing(self.introspector.list_constraints(table).await)? {
            dependencies.push(Dependency {
                name: constraint.name.clone(),
                schema: constraint.schema.clone(),
                impact: RiskLevel::Low,
                detection: Detection::Exact,
                description: format!("Constraint {}: {}", constraint.name, constraint.definition),
                detail: DependencyDetail::Constraint { constraint },
            });
        }

        let report =
            DependencyReport::new(table.clone(), None, dependencies).with_warnings(warnings);
        info!(
            "🔍 {}: {} dependencies, max impact {}",
            table,
            report.count(),
            report.max_impact()
        );
        Ok(report)
    }

    /// Direct views plus views built on top of them, breadth-first up to `MAX_VIEW_DEPTH`
    ///
    /// The transitive walk is best-effort: failures are recorded as warnings, not errors.
    async fn expand_views(
        &self,
        direct: Vec<(ViewInfo, Detection)>,
        warnings: &mut Vec<String>,
    ) -> Vec<Dependency> {
        let mut found = Vec::new();
        let mut visited: HashSet<(String, String)> = HashSet::new();
        let mut queue: VecDeque<(ViewInfo, u32)> = VecDeque::new();

        for (view, detection) in direct {
            if visited.insert((view.schema.clone(), view.name.clone())) {
                found.push(view_dependency(&view, 1, detection));
                queue.push_back((view, 1));
            }
        }

        while let Some((view, depth)) = queue.pop_front() {
            if depth >= MAX_VIEW_DEPTH {
                continue;
            }

            let view_ref = match TableRef::new(&view.schema, &view.name) {
                Ok(r) => r,
                Err(_) => continue,
            };

            let dependents = match self.introspector.list_views(&view_ref).await {
                Ok(views) => views,
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => {
                    warn!("Transitive view lookup failed for {}: {}", view_ref, e);
                    warnings.push(format!(
                        "Views depending on {} could not be listed: {}",
                        view_ref, e
                    ));
                    continue;
                }
            };

            for dependent in dependents {
                if visited.insert((dependent.schema.clone(), dependent.name.clone())) {
                    found.push(view_dependency(&dependent, depth + 1, Detection::BestEffort));
                    queue.push_back((dependent, depth + 1));
                }
            }
        }

        found
    }
}

/// Map "not found" to an empty value; propagate every other error
fn tolerate_missing<T: Default>(result: GuardResult<T>) -> GuardResult<T> {
    match result {
        Err(GuardError::SchemaNotFound(what)) => {
            debug!("Treating missing {} as empty", what);
            Ok(T::default())
        }
        other => other,
    }
}

fn is_table(schema: &str, name: &str, table: &TableRef) -> bool {
    schema == table.schema.as_str() && name == table.name.as_str()
}

fn classify_column_foreign_key(
    fk: ForeignKeyInfo,
    table: &TableRef,
    column: &str,
) -> Option<Dependency> {
    let incoming = is_table(&fk.referenced_schema, &fk.referenced_table, table)
        && fk.referenced_columns.iter().any(|c| c == column);
    let outgoing = is_table(&fk.source_schema, &fk.source_table, table)
        && fk.source_columns.iter().any(|c| c == column);

    let (direction, impact, description) = if incoming {
        let impact = match fk.on_delete {
            ReferentialAction::Cascade | ReferentialAction::Restrict | ReferentialAction::NoAction => {
                RiskLevel::Critical
            }
            ReferentialAction::SetNull | ReferentialAction::SetDefault => RiskLevel::High,
        };
        let description = format!(
            "{}.{}({}) references {} via {} (ON DELETE {})",
            fk.source_schema,
            fk.source_table,
            fk.source_columns.join(", "),
            column,
            fk.constraint_name,
            fk.on_delete
        );
        (FkDirection::Incoming, impact, description)
    } else if outgoing {
        let description = format!(
            "{} is part of foreign key {} to {}.{}",
            column, fk.constraint_name, fk.referenced_schema, fk.referenced_table
        );
        (FkDirection::Outgoing, RiskLevel::Medium, description)
    } else {
        return None;
    };

    Some(Dependency {
        name: fk.constraint_name.clone(),
        schema: fk.source_schema.clone(),
        impact,
        detection: Detection::Exact,
        description,
        detail: DependencyDetail::ForeignKey {
            direction,
            foreign_key: fk,
        },
    })
}

fn view_dependency(view: &ViewInfo, depth: u32, detection: Detection) -> Dependency {
    let (impact, label) = if view.is_materialized {
        (RiskLevel::High, "Materialized view")
    } else {
        (RiskLevel::Medium, "View")
    };
    let description = if depth == 1 {
        format!("{} {}.{} reads the target", label, view.schema, view.name)
    } else {
        format!(
            "{} {}.{} depends on the target through {} view level(s)",
            label,
            view.schema,
            view.name,
            depth - 1
        )
    };

    Dependency {
        name: view.name.clone(),
        schema: view.schema.clone(),
        impact,
        detection,
        description,
        detail: DependencyDetail::View {
            view: view.clone(),
            depth,
        },
    }
}

fn classify_column_trigger(trigger: TriggerInfo, column: &str) -> Option<Dependency> {
    let in_update_of = trigger.update_columns.iter().any(|c| c == column);
    let in_body = mentions_identifier(&trigger.function_body, column);
    let in_definition = mentions_identifier(&trigger.definition, column);

    if !(in_update_of || in_body || in_definition) {
        return None;
    }

    let impact = if in_body { RiskLevel::High } else { RiskLevel::Medium };
    let detection = if in_update_of { Detection::Exact } else { Detection::BestEffort };

    Some(Dependency {
        name: trigger.name.clone(),
        schema: trigger.schema.clone(),
        impact,
        detection,
        description: format!(
            "Trigger {} ({}) references {}",
            trigger.name, trigger.function_name, column
        ),
        detail: DependencyDetail::Trigger { trigger },
    })
}

fn classify_column_index(index: IndexInfo, column: &str) -> Option<Dependency> {
    let in_key = index.columns.iter().any(|c| c == column);
    let in_expression = any_mentions(
        [index.expression.as_deref(), index.predicate.as_deref()],
        column,
    );

    if !(in_key || in_expression) {
        return None;
    }

    let impact = if index.is_primary || index.is_unique {
        RiskLevel::High
    } else if index.columns.len() > 1 || index.expression.is_some() {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    let mut traits = Vec::new();
    if index.is_primary {
        traits.push("primary");
    } else if index.is_unique {
        traits.push("unique");
    }
    if index.predicate.is_some() {
        traits.push("partial");
    }
    if index.expression.is_some() {
        traits.push("expression");
    }
    let traits = if traits.is_empty() {
        String::new()
    } else {
        format!(" {}", traits.join(" "))
    };

    Some(Dependency {
        name: index.name.clone(),
        schema: index.schema.clone(),
        impact,
        detection: if in_key { Detection::Exact } else { Detection::BestEffort },
        description: format!(
            "{}{} index {} covers {}",
            index.index_type, traits, index.name, column
        ),
        detail: DependencyDetail::Index { index },
    })
}

fn classify_column_constraint(constraint: ConstraintInfo, column: &str) -> Option<Dependency> {
    let in_columns = constraint.columns.iter().any(|c| c == column);
    let in_definition = mentions_identifier(&constraint.definition, column);

    if !(in_columns || in_definition) {
        return None;
    }

    let impact = match constraint.kind {
        ConstraintKind::Check => RiskLevel::Medium,
        ConstraintKind::PrimaryKey | ConstraintKind::Unique | ConstraintKind::Exclusion => {
            RiskLevel::High
        }
    };

    Some(Dependency {
        name: constraint.name.clone(),
        schema: constraint.schema.clone(),
        impact,
        detection: if in_columns { Detection::Exact } else { Detection::BestEffort },
        description: format!("Constraint {}: {}", constraint.name, constraint.definition),
        detail: DependencyDetail::Constraint { constraint },
    })
}
