//! Staging Environments
//!
//! Ephemeral, isolated copies of a production schema used to rehearse migrations.
//! The manager owns its environments in an explicit map; nothing is process-global, so any
//! number of managers can coexist.

mod postgres;

pub use postgres::PgStagingBackend;

use crate::db::ConnectionProvider;
use crate::error::{GuardError, GuardResult};
use crate::introspection::SchemaIntrospector;
use crate::sql::Ident;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// The authoritative database a migration is validated against
#[derive(Clone)]
pub struct ProductionDatabase {
    pub name: String,
    pub schema: Ident,
    pub introspector: Arc<dyn SchemaIntrospector>,
}

impl ProductionDatabase {
    pub fn new(
        name: impl Into<String>,
        schema: Ident,
        introspector: Arc<dyn SchemaIntrospector>,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            introspector,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    /// Registered, nothing provisioned yet
    Reserved,
    Provisioned,
    Replicated,
}

/// One staging clone
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingEnvironment {
    pub id: Uuid,
    pub source_name: String,
    pub source_schema: String,
    /// Schema the clone lives in
    pub schema: String,
    pub sample_ratio: f64,
    /// Where the clone lives, without credentials
    pub connection_info: String,
    pub status: StagingStatus,
    pub created_at: DateTime<Utc>,
}

impl StagingEnvironment {
    fn new(production: &ProductionDatabase, sample_ratio: f64) -> Self {
        let id = Uuid::new_v4();
        let schema = format!("sf_staging_{}", &id.simple().to_string()[..12]);
        Self {
            id,
            source_name: production.name.clone(),
            source_schema: production.schema.to_string(),
            connection_info: format!("{}/{}", production.name, schema),
            schema,
            sample_ratio,
            status: StagingStatus::Reserved,
            created_at: Utc::now(),
        }
    }
}

/// Live access to a replicated staging environment
#[derive(Clone)]
pub struct StagingHandle {
    pub environment_id: Uuid,
    /// Sessions pinned to the staging schema
    pub connections: Arc<dyn ConnectionProvider>,
    pub introspector: Arc<dyn SchemaIntrospector>,
    /// Schema that holds the cloned tables
    pub schema: Ident,
}

/// Mechanics of building and destroying clones for one kind of backend
#[async_trait]
pub trait StagingBackend: Send + Sync {
    /// Create the empty isolated container (schema, database, ...)
    async fn provision(&self, env: &StagingEnvironment) -> GuardResult<()>;

    /// Copy schema objects, plus sampled rows when `include_data` is set
    async fn replicate(
        &self,
        env: &StagingEnvironment,
        include_data: bool,
    ) -> GuardResult<StagingHandle>;

    /// Destroy everything `provision`/`replicate` created; must tolerate partial state
    async fn teardown(&self, env: &StagingEnvironment) -> GuardResult<()>;
}

/// Owner of every staging environment it creates
pub struct StagingEnvironmentManager {
    backend: Arc<dyn StagingBackend>,
    environments: RwLock<HashMap<Uuid, StagingEnvironment>>,
}

impl StagingEnvironmentManager {
    pub fn new(backend: Arc<dyn StagingBackend>) -> Self {
        Self {
            backend,
            environments: RwLock::new(HashMap::new()),
        }
    }

    /// Register an environment without touching the backend
    ///
    /// The id is known before any I/O starts, so a caller that is cancelled mid-provision
    /// can still clean up.
    pub async fn reserve(
        &self,
        production: &ProductionDatabase,
        sample_ratio: f64,
    ) -> GuardResult<StagingEnvironment> {
        if !(sample_ratio > 0.0 && sample_ratio <= 1.0) {
            return Err(GuardError::Validation(format!(
                "sample ratio must be greater than 0 and at most 1, got {}",
                sample_ratio
            )));
        }

        let env = StagingEnvironment::new(production, sample_ratio);
        self.environments.write().await.insert(env.id, env.clone());
        info!("🧪 Reserved staging environment {} ({})", env.id, env.schema);
        Ok(env)
    }

    pub async fn provision(&self, id: Uuid) -> GuardResult<()> {
        let env = self.get(id).await?;
        self.backend.provision(&env).await?;
        self.set_status(id, StagingStatus::Provisioned).await;
        Ok(())
    }

    /// Reserve and provision in one call; a failed provision is cleaned up before returning
    pub async fn create_staging_environment(
        &self,
        production: &ProductionDatabase,
        sample_ratio: f64,
    ) -> GuardResult<StagingEnvironment> {
        let env = self.reserve(production, sample_ratio).await?;
        if let Err(e) = self.provision(env.id).await {
            error!("Provisioning staging environment {} failed: {}", env.id, e);
            if let Err(cleanup) = self.cleanup_staging_environment(env.id).await {
                warn!("Cleanup after failed provision also failed: {}", cleanup);
            }
            return Err(e);
        }
        self.get(env.id).await
    }

    pub async fn replicate_schema(
        &self,
        id: Uuid,
        include_data: bool,
    ) -> GuardResult<StagingHandle> {
        let env = self.get(id).await?;
        if env.status == StagingStatus::Reserved {
            return Err(GuardError::Staging(format!(
                "staging environment {} is not provisioned",
                id
            )));
        }

        let handle = self.backend.replicate(&env, include_data).await?;
        self.set_status(id, StagingStatus::Replicated).await;
        info!(
            "🧪 Replicated {} into staging {} (data: {}, ratio {})",
            env.source_schema, env.schema, include_data, env.sample_ratio
        );
        Ok(handle)
    }

    /// Tear the environment down and forget it
    ///
    /// The record is kept when teardown fails so the leak stays visible and retryable.
    pub async fn cleanup_staging_environment(&self, id: Uuid) -> GuardResult<()> {
        let env = self.get(id).await?;
        match self.backend.teardown(&env).await {
            Ok(()) => {
                self.environments.write().await.remove(&id);
                info!("🧹 Cleaned up staging environment {}", id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to tear down staging environment {}: {}", id, e);
                Err(e)
            }
        }
    }

    /// Environments this manager still owns
    pub async fn active_environments(&self) -> Vec<StagingEnvironment> {
        self.environments.read().await.values().cloned().collect()
    }

    async fn get(&self, id: Uuid) -> GuardResult<StagingEnvironment> {
        self.environments
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| GuardError::Staging(format!("unknown staging environment {}", id)))
    }

    async fn set_status(&self, id: Uuid, status: StagingStatus) {
        if let Some(env) = self.environments.write().await.get_mut(&id) {
            env.status = status;
        }
    }
}
