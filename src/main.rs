//! SchemaFlow Guard CLI
//!
//! Thin command-line front end over the safety engine. Every command prints a JSON document
//! on stdout; logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use schemaflow_guard::change::{ExecutionOptions, PlanOptions};
use schemaflow_guard::db::{create_pool, ConnectionParams, PgConnectionProvider};
use schemaflow_guard::error::ErrorReport;
use schemaflow_guard::introspection::{PgIntrospector, SchemaIntrospector};
use schemaflow_guard::staging::PgStagingBackend;
use schemaflow_guard::{
    ChangeExecutor, ChangePlanner, DependencyAnalyzer, ForeignKeyImpactAnalyzer, GuardError,
    Ident, MigrationInfo, MigrationOperation, OperationKind, ProductionDatabase,
    RiskAssessmentEngine, Settings, StagingEnvironmentManager, TableRef, TargetLockRegistry,
    ValidationPipeline,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "schemaflow-guard", version, about = "Schema migration safety engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report dependencies, FK impact and risk for a column or table
    Analyze {
        /// Table as `schema.table` or `table`
        #[arg(long)]
        table: String,
        #[arg(long)]
        column: Option<String>,
        /// Score as a production change
        #[arg(long)]
        production: bool,
    },
    /// Print the execution plan for a column removal
    PlanRemoval {
        #[arg(long)]
        table: String,
        #[arg(long)]
        column: String,
        #[arg(long)]
        production: bool,
    },
    /// Print the execution plan for a table rename
    PlanRename {
        #[arg(long)]
        table: String,
        #[arg(long)]
        new_name: String,
        #[arg(long)]
        production: bool,
    },
    /// Plan and execute a column removal
    Remove {
        #[arg(long)]
        table: String,
        #[arg(long)]
        column: String,
        #[arg(long)]
        dry_run: bool,
        /// Proceed despite CRITICAL dependencies
        #[arg(long = "override")]
        override_safety: bool,
    },
    /// Plan and execute a table rename
    Rename {
        #[arg(long)]
        table: String,
        #[arg(long)]
        new_name: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long = "override")]
        override_safety: bool,
    },
    /// Rehearse a migration on a staging clone
    Validate {
        /// JSON migration description
        file: PathBuf,
        /// Also write the result to this path
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

/// Shared engine wiring for one CLI invocation
struct Engine {
    settings: Settings,
    params: ConnectionParams,
    pool: deadpool_postgres::Pool,
    connections: Arc<PgConnectionProvider>,
    introspector: Arc<PgIntrospector>,
}

impl Engine {
    async fn connect(settings: Settings) -> anyhow::Result<Self> {
        let params = ConnectionParams::from(&settings.database)
            .with_search_path(settings.database.schema.clone());
        info!("🔌 Connecting to {}", params.to_display_string());
        let pool = create_pool(&params)?;
        let connections = Arc::new(PgConnectionProvider::new(pool.clone()));
        connections.verify().await?;
        let introspector = Arc::new(PgIntrospector::new(pool.clone()));

        Ok(Self {
            settings,
            params,
            pool,
            connections,
            introspector,
        })
    }

    fn table(&self, path: &str) -> Result<TableRef, GuardError> {
        TableRef::parse(path, &self.settings.database.schema)
    }

    fn risk_engine(&self) -> Result<RiskAssessmentEngine, GuardError> {
        RiskAssessmentEngine::new(self.settings.guard.risk_weights)
    }

    fn planner(&self) -> Result<ChangePlanner, GuardError> {
        Ok(ChangePlanner::new(self.introspector.clone(), self.risk_engine()?))
    }

    fn executor(&self) -> ChangeExecutor {
        ChangeExecutor::new(
            self.connections.clone(),
            self.introspector.clone(),
            Arc::new(TargetLockRegistry::new()),
            self.settings.guard.lock_timeout,
        )
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisOutput {
    dependencies: schemaflow_guard::DependencyReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    fk_impact: Option<schemaflow_guard::analysis::FkImpactReport>,
    risk: schemaflow_guard::ComprehensiveRiskAssessment,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let settings = Settings::load().context("failed to load configuration")?;
    info!("📋 Configuration loaded successfully");
    let engine = Engine::connect(settings).await?;

    match run(&engine, cli.command).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("❌ {}", e);
            print_json(&ErrorReport::from(&e))?;
            std::process::exit(1);
        }
    }
}

/// Run one command; the returned value is the process exit code
async fn run(engine: &Engine, command: Command) -> Result<i32, GuardError> {
    match command {
        Command::Analyze {
            table,
            column,
            production,
        } => {
            let table = engine.table(&table)?;
            let analyzer = DependencyAnalyzer::new(engine.introspector.clone());
            let fk_analyzer = ForeignKeyImpactAnalyzer::new(engine.introspector.clone());
            let (kind, dependencies, fk_impact) = match &column {
                Some(column) => (
                    OperationKind::RemoveColumn,
                    analyzer.analyze_column_dependencies(&table, column).await?,
                    fk_analyzer
                        .analyze_column_foreign_key_impact(&table, column, OperationKind::RemoveColumn)
                        .await
                        .ok(),
                ),
                None => (
                    OperationKind::DropTable,
                    analyzer.analyze_table_dependencies(&table).await?,
                    fk_analyzer
                        .analyze_foreign_key_impact(&table, OperationKind::DropTable)
                        .await
                        .ok(),
                ),
            };

            let mut operation = MigrationOperation::new(kind, table.clone()).in_production(production);
            operation.column = column;
            if let Ok(rows) = engine.introspector.estimate_rows(&table).await {
                operation = operation.with_estimated_rows(rows);
            }
            let risk = engine.risk_engine()?.calculate_migration_risk_score(
                &operation,
                &dependencies,
                fk_impact.as_ref(),
            );

            print_json(&AnalysisOutput {
                dependencies,
                fk_impact,
                risk,
            })?;
            Ok(0)
        }
        Command::PlanRemoval {
            table,
            column,
            production,
        } => {
            let options = PlanOptions {
                dry_run: true,
                is_production: production,
            };
            let plan = engine
                .planner()?
                .plan_column_removal(&engine.table(&table)?, &column, options)
                .await?;
            print_json(&plan)?;
            Ok(0)
        }
        Command::PlanRename {
            table,
            new_name,
            production,
        } => {
            let options = PlanOptions {
                dry_run: true,
                is_production: production,
            };
            let plan = engine
                .planner()?
                .plan_table_rename(&engine.table(&table)?, &new_name, options)
                .await?;
            print_json(&plan)?;
            Ok(0)
        }
        Command::Remove {
            table,
            column,
            dry_run,
            override_safety,
        } => {
            let options = PlanOptions {
                dry_run,
                is_production: true,
            };
            let plan = engine
                .planner()?
                .plan_column_removal(&engine.table(&table)?, &column, options)
                .await?;
            let result = engine
                .executor()
                .execute_safe_removal(
                    &plan,
                    ExecutionOptions {
                        dry_run,
                        override_safety,
                    },
                )
                .await?;
            print_json(&result)?;
            Ok(if result.is_success() { 0 } else { 2 })
        }
        Command::Rename {
            table,
            new_name,
            dry_run,
            override_safety,
        } => {
            let options = PlanOptions {
                dry_run,
                is_production: true,
            };
            let plan = engine
                .planner()?
                .plan_table_rename(&engine.table(&table)?, &new_name, options)
                .await?;
            let result = engine
                .executor()
                .execute(
                    &plan,
                    ExecutionOptions {
                        dry_run,
                        override_safety,
                    },
                )
                .await?;
            print_json(&result)?;
            Ok(if result.is_success() { 0 } else { 2 })
        }
        Command::Validate { file, export } => {
            let raw = tokio::fs::read(&file).await.map_err(|e| {
                GuardError::Validation(format!("cannot read {}: {}", file.display(), e))
            })?;
            let info: MigrationInfo = serde_json::from_slice(&raw).map_err(|e| {
                GuardError::Validation(format!("invalid migration file {}: {}", file.display(), e))
            })?;

            let backend = Arc::new(PgStagingBackend::new(engine.pool.clone(), engine.params.clone()));
            let staging = Arc::new(StagingEnvironmentManager::new(backend));
            let pipeline = ValidationPipeline::new(staging, engine.settings.guard.clone())?;
            let production = ProductionDatabase::new(
                engine.params.database.clone(),
                Ident::new(engine.settings.database.schema.as_str())?,
                engine.introspector.clone(),
            );

            let result = pipeline.validate_migration(&info, &production).await?;
            if let Some(path) = export {
                result.export_json(path).await?;
            }
            print_json(&result)?;
            Ok(if result.passed() { 0 } else { 2 })
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), GuardError> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| GuardError::Internal(format!("failed to serialize output: {}", e)))?;
    println!("{}", body);
    Ok(())
}

/// Initialize tracing with structured logging
///
/// `LOG_FORMAT=json` switches to one JSON object per line.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schemaflow_guard=debug"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}
