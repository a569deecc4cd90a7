//! Schema-scoped staging clones inside the production database
//!
//! Each environment is a fresh `sf_staging_*` schema. Tables are cloned with
//! `LIKE ... INCLUDING ALL`, rows are sampled with `TABLESAMPLE BERNOULLI`, foreign keys are
//! re-added `NOT VALID` (sampling breaks referential closure) and views are re-created in
//! creation order. Staging sessions come from a dedicated pool whose `search_path` is pinned
//! to the staging schema.

use super::{StagingBackend, StagingEnvironment, StagingHandle};
use crate::db::{create_pool, ConnectionParams, PgConnectionProvider};
use crate::error::{GuardError, GuardResult};
use crate::introspection::PgIntrospector;
use crate::sql::{quote_ident, Ident};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const LIST_TABLES: &str = r#"
    SELECT c.relname::text AS table_name
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relkind IN ('r', 'p') AND NOT c.relispartition
    ORDER BY c.relname
"#;

/// Same-schema foreign keys; definitions render unqualified under the source search_path
const LIST_FOREIGN_KEYS: &str = r#"
    SELECT
        con.conname::text AS constraint_name,
        rel.relname::text AS table_name,
        pg_get_constraintdef(con.oid) AS definition
    FROM pg_catalog.pg_constraint con
    JOIN pg_catalog.pg_class rel ON rel.oid = con.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = rel.relnamespace
    JOIN pg_catalog.pg_class ref ON ref.oid = con.confrelid
    JOIN pg_catalog.pg_namespace refn ON refn.oid = ref.relnamespace
    WHERE con.contype = 'f' AND n.nspname = $1 AND refn.nspname = $1
    ORDER BY con.oid
"#;

const LIST_VIEWS: &str = r#"
    SELECT
        c.relname::text AS view_name,
        c.relkind = 'm' AS is_materialized,
        pg_get_viewdef(c.oid) AS definition
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relkind IN ('v', 'm')
    ORDER BY c.oid
"#;

const LIST_TRIGGERS: &str = r#"
    SELECT
        t.tgname::text AS trigger_name,
        pg_get_triggerdef(t.oid) AS definition,
        p.proname::text AS function_name,
        pn.nspname::text AS function_schema
    FROM pg_catalog.pg_trigger t
    JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    JOIN pg_catalog.pg_proc p ON p.oid = t.tgfoid
    JOIN pg_catalog.pg_namespace pn ON pn.oid = p.pronamespace
    WHERE n.nspname = $1 AND NOT t.tgisinternal
    ORDER BY t.oid
"#;

struct SourceObjects {
    tables: Vec<String>,
    foreign_keys: Vec<(String, String, String)>,
    views: Vec<(String, bool, String)>,
    triggers: Vec<String>,
}

/// Clones a schema into a sibling schema of the same database
pub struct PgStagingBackend {
    /// Admin pool on the production database
    pool: Pool,
    params: ConnectionParams,
    pools: Mutex<HashMap<uuid::Uuid, Pool>>,
}

impl PgStagingBackend {
    pub fn new(pool: Pool, params: ConnectionParams) -> Self {
        Self {
            pool,
            params,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Read object definitions with the source schema as the only search_path entry, so
    /// same-schema references come back unqualified and re-target cleanly
    async fn read_source(&self, source_schema: &str) -> GuardResult<SourceObjects> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&format!(
            "SET LOCAL search_path TO {}",
            quote_ident(source_schema)
        ))
        .await?;

        let tables = tx
            .query(LIST_TABLES, &[&source_schema])
            .await?
            .iter()
            .map(|row| row.get("table_name"))
            .collect();

        let foreign_keys = tx
            .query(LIST_FOREIGN_KEYS, &[&source_schema])
            .await?
            .iter()
            .map(|row| {
                (
                    row.get("table_name"),
                    row.get("constraint_name"),
                    row.get("definition"),
                )
            })
            .collect();

        let views = tx
            .query(LIST_VIEWS, &[&source_schema])
            .await?
            .iter()
            .map(|row| {
                (
                    row.get("view_name"),
                    row.get("is_materialized"),
                    row.get("definition"),
                )
            })
            .collect();

        let mut triggers = Vec::new();
        for row in tx.query(LIST_TRIGGERS, &[&source_schema]).await? {
            let definition: String = row.get("definition");
            let function_name: String = row.get("function_name");
            let function_schema: String = row.get("function_schema");
            triggers.push(qualify_trigger_function(
                &definition,
                &function_schema,
                &function_name,
            ));
        }

        tx.rollback().await?;
        Ok(SourceObjects {
            tables,
            foreign_keys,
            views,
            triggers,
        })
    }

    fn replication_statements(
        env: &StagingEnvironment,
        objects: &SourceObjects,
        include_data: bool,
    ) -> Vec<String> {
        let source = quote_ident(&env.source_schema);
        let staging = quote_ident(&env.schema);
        let percent = env.sample_ratio * 100.0;

        let mut statements = vec![format!("SET LOCAL search_path TO {}", staging)];
        for table in &objects.tables {
            let name = quote_ident(table);
            statements.push(format!(
                "CREATE TABLE {staging}.{name} (LIKE {source}.{name} INCLUDING ALL)"
            ));
            if include_data && percent > 0.0 {
                statements.push(format!(
                    "INSERT INTO {staging}.{name} SELECT * FROM {source}.{name} TABLESAMPLE BERNOULLI ({percent})"
                ));
            }
        }
        for (table, constraint, definition) in &objects.foreign_keys {
            statements.push(format!(
                "ALTER TABLE {staging}.{} ADD CONSTRAINT {} {} NOT VALID",
                quote_ident(table),
                quote_ident(constraint),
                definition
            ));
        }
        for (view, is_materialized, definition) in &objects.views {
            let kind = if *is_materialized { "MATERIALIZED VIEW" } else { "VIEW" };
            statements.push(format!(
                "CREATE {kind} {staging}.{} AS {}",
                quote_ident(view),
                definition.trim_end_matches(';')
            ));
        }
        statements.extend(objects.triggers.iter().cloned());
        statements
    }
}

/// pg_get_triggerdef leaves the function unqualified when it is visible; the staging
/// search_path will not see it
fn qualify_trigger_function(definition: &str, schema: &str, function: &str) -> String {
    let qualified = format!("{}.{}(", quote_ident(schema), quote_ident(function));
    let mut result = definition.to_string();
    for keyword in ["EXECUTE FUNCTION ", "EXECUTE PROCEDURE "] {
        for candidate in [format!("{}(", function), format!("{}(", quote_ident(function))] {
            let needle = format!("{}{}", keyword, candidate);
            if result.contains(&needle) {
                result = result.replace(&needle, &format!("{}{}", keyword, qualified));
            }
        }
    }
    result
}

#[async_trait]
impl StagingBackend for PgStagingBackend {
    async fn provision(&self, env: &StagingEnvironment) -> GuardResult<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!("CREATE SCHEMA {}", quote_ident(&env.schema)))
            .await?;
        debug!("Created staging schema {}", env.schema);
        Ok(())
    }

    async fn replicate(
        &self,
        env: &StagingEnvironment,
        include_data: bool,
    ) -> GuardResult<StagingHandle> {
        let objects = self.read_source(&env.source_schema).await?;
        info!(
            "🧪 Cloning {} tables, {} foreign keys, {} views, {} triggers into {}",
            objects.tables.len(),
            objects.foreign_keys.len(),
            objects.views.len(),
            objects.triggers.len(),
            env.schema
        );

        let statements = Self::replication_statements(env, &objects, include_data);
        {
            let mut client = self.pool.get().await?;
            let tx = client.transaction().await?;
            for statement in &statements {
                tx.batch_execute(statement).await.map_err(|e| {
                    GuardError::Staging(format!("replication failed at `{}`: {}", statement, e))
                })?;
            }
            tx.commit().await?;
        }

        let params = self.params.clone().with_search_path(env.schema.clone());
        let pool = create_pool(&params)?;
        self.pools
            .lock()
            .map_err(|_| GuardError::Internal("staging pool registry poisoned".to_string()))?
            .insert(env.id, pool.clone());

        Ok(StagingHandle {
            environment_id: env.id,
            connections: Arc::new(PgConnectionProvider::new(pool.clone())),
            introspector: Arc::new(PgIntrospector::new(pool)),
            schema: Ident::new(env.schema.clone())?,
        })
    }

    async fn teardown(&self, env: &StagingEnvironment) -> GuardResult<()> {
        let pool = self
            .pools
            .lock()
            .map_err(|_| GuardError::Internal("staging pool registry poisoned".to_string()))?
            .remove(&env.id);
        if let Some(pool) = pool {
            pool.close();
        }

        let client = self.pool.get().await?;
        client
            .batch_execute(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                quote_ident(&env.schema)
            ))
            .await
            .map_err(|e| {
                warn!("Dropping staging schema {} failed: {}", env.schema, e);
                GuardError::from(e)
            })?;
        debug!("Dropped staging schema {}", env.schema);
        Ok(())
    }
}
