//! Change execution
//!
//! Steps run strictly in order, one transaction each. A failure rolls back every committed
//! step in reverse order before returning.

use super::{ChangePlan, ChangePlanner, ChangeStep, StageKind, TargetLockRegistry};
use crate::db::{ConnectionProvider, DbSession};
use crate::error::{GuardError, GuardResult};
use crate::introspection::SchemaIntrospector;
use crate::operation::OperationKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    pub dry_run: bool,
    /// Run even when the safety gate reports CRITICAL dependencies
    pub override_safety: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Executed,
    Simulated,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub stage: StageKind,
    pub action: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionOutcome {
    Success,
    /// A step failed and the rollback could not finish
    Partial,
    /// A step failed and every committed step was rolled back
    TransactionFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeExecutionResult {
    pub plan_id: Uuid,
    /// Append-only log of what happened to each step
    pub stages_completed: Vec<StageRecord>,
    #[serde(rename = "result")]
    pub outcome: ExecutionOutcome,
    pub rollback_executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_instructions: Vec<String>,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ChangeExecutionResult {
    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }

    /// Convert a failed outcome into `GuardError::TransactionFailure`
    pub fn into_result(self) -> GuardResult<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let failed = self
            .stages_completed
            .iter()
            .find(|r| r.status == StageStatus::Failed);
        Err(GuardError::TransactionFailure {
            stage: failed.map_or_else(|| "unknown".to_string(), |r| r.stage.to_string()),
            message: failed
                .and_then(|r| r.message.clone())
                .unwrap_or_else(|| "execution failed".to_string()),
            recovery_instructions: self.recovery_instructions,
        })
    }
}

pub struct ChangeExecutor {
    connections: Arc<dyn ConnectionProvider>,
    introspector: Arc<dyn SchemaIntrospector>,
    locks: Arc<TargetLockRegistry>,
    lock_timeout: Duration,
}

impl ChangeExecutor {
    pub fn new(
        connections: Arc<dyn ConnectionProvider>,
        introspector: Arc<dyn SchemaIntrospector>,
        locks: Arc<TargetLockRegistry>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            connections,
            introspector,
            locks,
            lock_timeout,
        }
    }

    /// Run a column-removal plan behind the safety gate
    pub async fn execute_safe_removal(
        &self,
        plan: &ChangePlan,
        options: ExecutionOptions,
    ) -> GuardResult<ChangeExecutionResult> {
        if plan.operation != OperationKind::RemoveColumn {
            return Err(GuardError::Planning(format!(
                "plan {} is a {}, not a column removal",
                plan.id, plan.operation
            )));
        }
        self.execute(plan, options).await
    }

    /// Run any plan
    ///
    /// Errors are returned for refusals that happen before any DDL: the safety gate, lock
    /// contention, an unreadable baseline row count or no connection. Once steps start,
    /// failures are reported in the result.
    pub async fn execute(
        &self,
        plan: &ChangePlan,
        options: ExecutionOptions,
    ) -> GuardResult<ChangeExecutionResult> {
        let started_at = Utc::now();

        if options.dry_run || plan.dry_run {
            return Ok(simulate(plan, started_at));
        }

        let safety = ChangePlanner::validate_removal_safety(plan);
        if !safety.is_safe && !options.override_safety {
            warn!(
                "⛔ Refusing {} on {}: {} blocking dependencies",
                plan.operation,
                plan.table,
                safety.blocking_dependencies.len()
            );
            return Err(GuardError::SafetyBlocked {
                reason: format!(
                    "{} on {}.{} has CRITICAL risk; pass an explicit override to proceed",
                    plan.operation, plan.table, plan.target
                ),
                blocking: safety.blocking_dependencies,
            });
        }
        if !safety.is_safe {
            warn!("Safety gate overridden for plan {}", plan.id);
        }

        let _lock = self
            .locks
            .acquire(&plan.lock_keys(), self.lock_timeout)
            .await?;
        // Row-count checks compare against this, so no step may run without it
        let baseline_rows = self.introspector.count_rows(&plan.table).await?;
        let mut session = self.connections.acquire().await?;

        info!(
            "🚀 Executing plan {} ({} on {}, {} steps)",
            plan.id,
            plan.operation,
            plan.table,
            plan.steps.len()
        );

        let mut records = Vec::new();
        let mut committed: Vec<&ChangeStep> = Vec::new();
        for step in &plan.steps {
            match self
                .run_step(session.as_mut(), step, Some(baseline_rows), &mut committed)
                .await
            {
                Ok(()) => records.push(StageRecord {
                    stage: step.stage,
                    action: step.action.clone(),
                    status: StageStatus::Executed,
                    message: None,
                }),
                Err(e) => {
                    error!("❌ {} ({}) failed: {}", step.stage, step.action, e);
                    records.push(StageRecord {
                        stage: step.stage,
                        action: step.action.clone(),
                        status: StageStatus::Failed,
                        message: Some(e.to_string()),
                    });
                    return Ok(self
                        .roll_back(session.as_mut(), plan, committed, records, started_at)
                        .await);
                }
            }
        }

        info!("✅ Plan {} completed", plan.id);
        Ok(ChangeExecutionResult {
            plan_id: plan.id,
            stages_completed: records,
            outcome: ExecutionOutcome::Success,
            rollback_executed: false,
            backup_location: plan.backup_table.as_ref().map(|t| t.to_string()),
            recovery_instructions: Vec::new(),
            dry_run: false,
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// Commit the step's SQL, then check its post-conditions
    ///
    /// The step is recorded as committed as soon as its transaction succeeds, so a failed
    /// verification still rolls it back.
    async fn run_step<'a>(
        &self,
        session: &mut dyn DbSession,
        step: &'a ChangeStep,
        baseline_rows: Option<i64>,
        committed: &mut Vec<&'a ChangeStep>,
    ) -> GuardResult<()> {
        if !step.forward_sql.is_empty() {
            session.transaction(&step.forward_sql).await?;
            committed.push(step);
        }
        for verification in &step.verifications {
            verification
                .check(self.introspector.as_ref(), baseline_rows)
                .await?;
        }
        Ok(())
    }

    async fn roll_back(
        &self,
        session: &mut dyn DbSession,
        plan: &ChangePlan,
        committed: Vec<&ChangeStep>,
        mut records: Vec<StageRecord>,
        started_at: DateTime<Utc>,
    ) -> ChangeExecutionResult {
        warn!(
            "↩️ Rolling back {} committed steps of plan {}",
            committed.len(),
            plan.id
        );
        let rollback_executed = !committed.is_empty();
        let backup_created = committed
            .iter()
            .any(|s| s.stage == StageKind::BackupCreation);

        let mut pending = committed.iter().rev().peekable();
        let mut stuck: Option<String> = None;
        while let Some(step) = pending.next() {
            if step.rollback_sql.is_empty() {
                continue;
            }
            match session.transaction(&step.rollback_sql).await {
                Ok(()) => records.push(StageRecord {
                    stage: step.stage,
                    action: step.action.clone(),
                    status: StageStatus::RolledBack,
                    message: None,
                }),
                Err(e) => {
                    error!("Rollback of {} ({}) failed: {}", step.stage, step.action, e);
                    let mut remaining: Vec<&str> =
                        step.rollback_sql.iter().map(String::as_str).collect();
                    for later in pending.by_ref() {
                        remaining.extend(later.rollback_sql.iter().map(String::as_str));
                    }
                    stuck = Some(format!(
                        "Rollback stopped at {} ({}): {}. Run these statements manually, in order: {}",
                        step.stage,
                        step.action,
                        e,
                        remaining.join("; ")
                    ));
                    break;
                }
            }
        }

        let backup = plan.backup_table.as_ref().map(|t| t.to_string());
        let completed_at = Utc::now();
        match stuck {
            None => {
                info!("Plan {} rolled back; {} is unchanged", plan.id, plan.table);
                let mut recovery_instructions = vec![format!(
                    "All committed steps were rolled back; {} is back in its original shape",
                    plan.table
                )];
                if backup_created {
                    recovery_instructions.push(format!(
                        "Backup table {} was removed during rollback",
                        backup.as_deref().unwrap_or("-")
                    ));
                }
                recovery_instructions
                    .push("Inspect the failed stage message before retrying".to_string());
                ChangeExecutionResult {
                    plan_id: plan.id,
                    stages_completed: records,
                    outcome: ExecutionOutcome::TransactionFailed,
                    rollback_executed,
                    backup_location: None,
                    recovery_instructions,
                    dry_run: false,
                    started_at,
                    completed_at,
                }
            }
            Some(message) => {
                let mut recovery_instructions = vec![message];
                if let (true, Some(table)) = (backup_created, &backup) {
                    recovery_instructions.push(format!(
                        "Backup table {} was kept; restore {} data from it",
                        table, plan.target
                    ));
                }
                ChangeExecutionResult {
                    plan_id: plan.id,
                    stages_completed: records,
                    outcome: ExecutionOutcome::Partial,
                    rollback_executed,
                    backup_location: if backup_created { backup } else { None },
                    recovery_instructions,
                    dry_run: false,
                    started_at,
                    completed_at,
                }
            }
        }
    }
}

/// Dry run: every step is reported, nothing touches the database
fn simulate(plan: &ChangePlan, started_at: DateTime<Utc>) -> ChangeExecutionResult {
    info!(
        "🧪 Dry run of plan {}: {} steps simulated",
        plan.id,
        plan.steps.len()
    );
    let stages_completed = plan
        .steps
        .iter()
        .map(|step| StageRecord {
            stage: step.stage,
            action: step.action.clone(),
            status: StageStatus::Simulated,
            message: Some(format!(
                "would run {} statements",
                step.forward_sql.len()
            )),
        })
        .collect();

    ChangeExecutionResult {
        plan_id: plan.id,
        stages_completed,
        outcome: ExecutionOutcome::Success,
        rollback_executed: false,
        backup_location: None,
        recovery_instructions: Vec::new(),
        dry_run: true,
        started_at,
        completed_at: Utc::now(),
    }
}
