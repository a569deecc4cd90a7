//! In-memory database for unit tests
//!
//! A catalog plus a small DDL interpreter that understands the statements the planner and
//! the staging pipeline emit. Transactions apply to a copy of the catalog and swap it in on
//! success. Failures, latency and open sessions are all observable from tests.

use crate::db::{ConnectionProvider, DbSession};
use crate::error::{GuardError, GuardResult};
use crate::introspection::{
    ColumnInfo, ConstraintInfo, ConstraintKind, ForeignKeyInfo, IndexInfo, ReferentialAction,
    SchemaIntrospector, TriggerInfo, ViewInfo,
};
use crate::analysis::references::mentions_identifier;
use crate::sql::{Ident, TableRef};
use crate::staging::{StagingBackend, StagingEnvironment, StagingHandle};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

type Key = (String, String);

#[derive(Debug, Clone)]
struct FakeTable {
    columns: Vec<ColumnInfo>,
    rows: i64,
    /// Rows holding NULL in a column
    null_rows: BTreeMap<String, i64>,
}

#[derive(Debug, Clone)]
struct FakeView {
    info: ViewInfo,
    base: Key,
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    tables: BTreeMap<Key, FakeTable>,
    foreign_keys: Vec<ForeignKeyInfo>,
    views: Vec<FakeView>,
    indexes: Vec<IndexInfo>,
    triggers: Vec<TriggerInfo>,
    constraints: Vec<ConstraintInfo>,
    // Dropped objects, so that CREATE statements replaying their definitions restore them
    dropped_views: Vec<FakeView>,
    dropped_indexes: Vec<IndexInfo>,
    dropped_triggers: Vec<TriggerInfo>,
    ddl_applied: usize,
}

struct State {
    catalog: Catalog,
    search_path: String,
    statements: Vec<String>,
    fail_on: Vec<String>,
    fail_catalog: bool,
    statement_latency: Duration,
    query_latency: (Duration, Duration),
    open_sessions: usize,
}

/// Cloning shares the same underlying database
#[derive(Clone)]
pub struct FakeDatabase {
    state: Arc<Mutex<State>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                catalog: Catalog::default(),
                search_path: "public".to_string(),
                statements: Vec::new(),
                fail_on: Vec::new(),
                fail_catalog: false,
                statement_latency: Duration::ZERO,
                query_latency: (Duration::ZERO, Duration::ZERO),
                open_sessions: 0,
            })),
        }
    }

    /// users(id PK, email, deprecated_field) with 3 rows, orders(id PK, user_id → users.id,
    /// total) with 5 rows
    pub fn with_users_and_orders(on_delete: ReferentialAction) -> Self {
        let db = Self::new();
        db.add_table(
            "public",
            "users",
            &[("id", "integer"), ("email", "text"), ("deprecated_field", "character varying(100)")],
            &["id"],
        );
        db.add_table(
            "public",
            "orders",
            &[("id", "integer"), ("user_id", "integer"), ("total", "numeric")],
            &["id"],
        );
        db.add_foreign_key(ForeignKeyInfo {
            constraint_name: "orders_user_id_fkey".to_string(),
            source_schema: "public".to_string(),
            source_table: "orders".to_string(),
            source_columns: vec!["user_id".to_string()],
            referenced_schema: "public".to_string(),
            referenced_table: "users".to_string(),
            referenced_columns: vec!["id".to_string()],
            on_update: ReferentialAction::NoAction,
            on_delete,
            validated: true,
        });
        db.set_rows("users", 3);
        db.set_rows("orders", 5);
        db
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake database mutex poisoned")
    }

    // -------------------------------------------------------------------------
    // Catalog setup
    // -------------------------------------------------------------------------

    pub fn add_table(&self, schema: &str, name: &str, columns: &[(&str, &str)], pk: &[&str]) {
        let mut state = self.lock();
        let cat = &mut state.catalog;
        cat.tables.insert(
            (schema.to_string(), name.to_string()),
            FakeTable {
                columns: columns
                    .iter()
                    .map(|(c, t)| ColumnInfo {
                        name: c.to_string(),
                        data_type: t.to_string(),
                        nullable: !pk.contains(c),
                        default_value: None,
                        is_primary_key: pk.contains(c),
                    })
                    .collect(),
                rows: 0,
                null_rows: BTreeMap::new(),
            },
        );
        if !pk.is_empty() {
            let pk_name = format!("{}_pkey", name);
            let cols: Vec<String> = pk.iter().map(|c| c.to_string()).collect();
            cat.constraints.push(ConstraintInfo {
                name: pk_name.clone(),
                schema: schema.to_string(),
                table: name.to_string(),
                kind: ConstraintKind::PrimaryKey,
                columns: cols.clone(),
                definition: format!("PRIMARY KEY ({})", cols.join(", ")),
                validated: true,
            });
            cat.indexes.push(IndexInfo {
                definition: format!(
                    "CREATE UNIQUE INDEX {} ON {}.{} USING btree ({})",
                    pk_name,
                    schema,
                    name,
                    cols.join(", ")
                ),
                name: pk_name,
                schema: schema.to_string(),
                table: name.to_string(),
                columns: cols,
                is_unique: true,
                is_primary: true,
                index_type: "btree".to_string(),
                expression: None,
                predicate: None,
            });
        }
    }

    pub fn set_rows(&self, table: &str, rows: i64) {
        let mut state = self.lock();
        let key = (state.search_path.clone(), table.to_string());
        if let Some(t) = state.catalog.tables.get_mut(&key) {
            t.rows = rows;
        }
    }

    /// Mark `rows` rows of `table` as holding NULL in `column`
    pub fn set_null_rows(&self, table: &str, column: &str, rows: i64) {
        let mut state = self.lock();
        let key = (state.search_path.clone(), table.to_string());
        if let Some(t) = state.catalog.tables.get_mut(&key) {
            t.null_rows.insert(column.to_string(), rows);
        }
    }

    pub fn add_foreign_key(&self, fk: ForeignKeyInfo) {
        self.lock().catalog.foreign_keys.push(fk);
    }

    pub fn add_view(
        &self,
        schema: &str,
        name: &str,
        materialized: bool,
        definition: &str,
        base_table: &str,
        referenced_columns: Option<&[&str]>,
    ) {
        self.lock().catalog.views.push(FakeView {
            info: ViewInfo {
                schema: schema.to_string(),
                name: name.to_string(),
                is_materialized: materialized,
                definition: definition.to_string(),
                referenced_columns: referenced_columns
                    .map(|cols| cols.iter().map(|c| c.to_string()).collect()),
            },
            base: (schema.to_string(), base_table.to_string()),
        });
    }

    pub fn add_index(
        &self,
        table: &str,
        name: &str,
        columns: &[&str],
        unique: bool,
        expression: Option<&str>,
        predicate: Option<&str>,
    ) {
        let mut keys: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        if let Some(expr) = expression {
            keys.push(expr.to_string());
        }
        let mut definition = format!(
            "CREATE {}INDEX {} ON public.{} USING btree ({})",
            if unique { "UNIQUE " } else { "" },
            name,
            table,
            keys.join(", ")
        );
        if let Some(pred) = predicate {
            definition.push_str(&format!(" WHERE {}", pred));
        }

        self.lock().catalog.indexes.push(IndexInfo {
            name: name.to_string(),
            schema: "public".to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            is_unique: unique,
            is_primary: false,
            index_type: "btree".to_string(),
            expression: expression.map(str::to_string),
            predicate: predicate.map(str::to_string),
            definition,
        });
    }

    pub fn add_trigger(&self, table: &str, name: &str, body: &str, update_columns: &[&str]) {
        let event = if update_columns.is_empty() {
            "UPDATE".to_string()
        } else {
            format!("UPDATE OF {}", update_columns.join(", "))
        };
        self.lock().catalog.triggers.push(TriggerInfo {
            name: name.to_string(),
            schema: "public".to_string(),
            table: table.to_string(),
            function_name: format!("{}_fn", name),
            function_body: body.to_string(),
            update_columns: update_columns.iter().map(|c| c.to_string()).collect(),
            definition: format!(
                "CREATE TRIGGER {} BEFORE {} ON public.{} FOR EACH ROW EXECUTE FUNCTION {}_fn()",
                name, event, table, name
            ),
        });
    }

    pub fn add_constraint(
        &self,
        table: &str,
        name: &str,
        kind: ConstraintKind,
        columns: &[&str],
        definition: &str,
    ) {
        self.lock().catalog.constraints.push(ConstraintInfo {
            name: name.to_string(),
            schema: "public".to_string(),
            table: table.to_string(),
            kind,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            definition: definition.to_string(),
            validated: true,
        });
    }

    // -------------------------------------------------------------------------
    // Behaviour knobs
    // -------------------------------------------------------------------------

    pub fn fail_catalog(&self, fail: bool) {
        self.lock().fail_catalog = fail;
    }

    /// Any statement containing `fragment` fails
    pub fn fail_on(&self, fragment: &str) {
        self.lock().fail_on.push(fragment.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().fail_on.clear();
    }

    pub fn set_statement_latency(&self, latency: Duration) {
        self.lock().statement_latency = latency;
    }

    /// SELECT latency before and after the first DDL statement is applied
    pub fn set_query_latency(&self, before_ddl: Duration, after_ddl: Duration) {
        self.lock().query_latency = (before_ddl, after_ddl);
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn introspector(&self) -> Arc<dyn SchemaIntrospector> {
        Arc::new(self.clone())
    }

    pub fn connections(&self) -> Arc<dyn ConnectionProvider> {
        Arc::new(self.clone())
    }

    /// Every statement received, in order, including failed ones
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn has_table(&self, name: &str) -> bool {
        let state = self.lock();
        let key = (state.search_path.clone(), name.to_string());
        state.catalog.tables.contains_key(&key)
    }

    pub fn columns(&self, table: &str) -> Vec<String> {
        let state = self.lock();
        let key = (state.search_path.clone(), table.to_string());
        state
            .catalog
            .tables
            .get(&key)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn rows(&self, table: &str) -> i64 {
        let state = self.lock();
        let key = (state.search_path.clone(), table.to_string());
        state.catalog.tables.get(&key).map_or(0, |t| t.rows)
    }

    pub fn backup_tables(&self) -> Vec<String> {
        self.lock()
            .catalog
            .tables
            .keys()
            .filter(|(_, name)| name.starts_with("sfbak_"))
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Comparable rendering of all live schema objects
    pub fn fingerprint(&self) -> String {
        let state = self.lock();
        let cat = &state.catalog;
        let mut parts = Vec::new();
        for ((schema, name), table) in &cat.tables {
            let mut cols: Vec<String> = table
                .columns
                .iter()
                .map(|c| format!("{}:{}:{}", c.name, c.data_type, c.nullable))
                .collect();
            cols.sort();
            parts.push(format!("table {}.{} rows={} [{}]", schema, name, table.rows, cols.join(",")));
        }
        for fk in &cat.foreign_keys {
            parts.push(format!(
                "fk {} {}.{}({:?})->{}.{}({:?}) {}",
                fk.constraint_name,
                fk.source_schema,
                fk.source_table,
                fk.source_columns,
                fk.referenced_schema,
                fk.referenced_table,
                fk.referenced_columns,
                fk.on_delete
            ));
        }
        for v in &cat.views {
            parts.push(format!("view {}.{} on {}.{}", v.info.schema, v.info.name, v.base.0, v.base.1));
        }
        for i in &cat.indexes {
            parts.push(format!("index {}.{} on {} {:?}", i.schema, i.name, i.table, i.columns));
        }
        for t in &cat.triggers {
            parts.push(format!("trigger {} on {}", t.name, t.table));
        }
        for c in &cat.constraints {
            parts.push(format!("constraint {} on {} {:?}", c.name, c.table, c.columns));
        }
        parts.sort();
        parts.join("\n")
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    fn latency_for(&self, statements: &[String]) -> Duration {
        let state = self.lock();
        statements
            .iter()
            .map(|s| {
                if is_query(s) {
                    if state.catalog.ddl_applied == 0 {
                        state.query_latency.0
                    } else {
                        state.query_latency.1
                    }
                } else {
                    state.statement_latency
                }
            })
            .sum()
    }

    /// Apply statements atomically; `commit = false` always discards the result
    async fn run(&self, statements: &[String], commit: bool) -> GuardResult<()> {
        let latency = self.latency_for(statements);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        let mut working = state.catalog.clone();
        let search_path = state.search_path.clone();
        for statement in statements {
            state.statements.push(statement.clone());
            if let Some(fragment) = state.fail_on.iter().find(|f| statement.contains(f.as_str())) {
                return Err(GuardError::Internal(format!(
                    "injected failure ({}) executing: {}",
                    fragment, statement
                )));
            }
            for part in split_statements(statement) {
                apply(&mut working, &search_path, &part)?;
            }
        }
        if commit {
            state.catalog = working;
        }
        Ok(())
    }

    fn check_catalog(&self) -> GuardResult<()> {
        if self.lock().fail_catalog {
            return Err(GuardError::Internal("catalog unavailable".to_string()));
        }
        Ok(())
    }

    fn with_catalog<T>(&self, f: impl FnOnce(&Catalog) -> T) -> GuardResult<T> {
        self.check_catalog()?;
        Ok(f(&self.lock().catalog))
    }

    fn replica(&self, sample_ratio: f64, include_data: bool) -> FakeDatabase {
        let state = self.lock();
        let mut catalog = state.catalog.clone();
        catalog.dropped_views.clear();
        catalog.dropped_indexes.clear();
        catalog.dropped_triggers.clear();
        catalog.ddl_applied = 0;
        for table in catalog.tables.values_mut() {
            table.rows = if include_data {
                (table.rows as f64 * sample_ratio).round() as i64
            } else {
                0
            };
        }

        FakeDatabase {
            state: Arc::new(Mutex::new(State {
                catalog,
                search_path: state.search_path.clone(),
                statements: Vec::new(),
                fail_on: state.fail_on.clone(),
                fail_catalog: state.fail_catalog,
                statement_latency: state.statement_latency,
                query_latency: state.query_latency,
                open_sessions: 0,
            })),
        }
    }
}

impl Default for FakeDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn key_of(table: &TableRef) -> Key {
    (table.schema.to_string(), table.name.to_string())
}

#[async_trait]
impl SchemaIntrospector for FakeDatabase {
    async fn table_exists(&self, table: &TableRef) -> GuardResult<bool> {
        self.with_catalog(|c| c.tables.contains_key(&key_of(table)))
    }

    async fn list_columns(&self, table: &TableRef) -> GuardResult<Vec<ColumnInfo>> {
        self.with_catalog(|c| {
            c.tables
                .get(&key_of(table))
                .map(|t| t.columns.clone())
                .unwrap_or_default()
        })
    }

    async fn list_foreign_keys(&self, table: &TableRef) -> GuardResult<Vec<ForeignKeyInfo>> {
        let (schema, name) = key_of(table);
        self.with_catalog(|c| {
            c.foreign_keys
                .iter()
                .filter(|fk| {
                    (fk.source_schema == schema && fk.source_table == name)
                        || (fk.referenced_schema == schema && fk.referenced_table == name)
                })
                .cloned()
                .collect()
        })
    }

    async fn list_indexes(&self, table: &TableRef) -> GuardResult<Vec<IndexInfo>> {
        let (schema, name) = key_of(table);
        self.with_catalog(|c| {
            c.indexes
                .iter()
                .filter(|i| i.schema == schema && i.table == name)
                .cloned()
                .collect()
        })
    }

    async fn list_views(&self, table: &TableRef) -> GuardResult<Vec<ViewInfo>> {
        let key = key_of(table);
        self.with_catalog(|c| {
            c.views
                .iter()
                .filter(|v| v.base == key)
                .map(|v| v.info.clone())
                .collect()
        })
    }

    async fn list_triggers(&self, table: &TableRef) -> GuardResult<Vec<TriggerInfo>> {
        let (schema, name) = key_of(table);
        self.with_catalog(|c| {
            c.triggers
                .iter()
                .filter(|t| t.schema == schema && t.table == name)
                .cloned()
                .collect()
        })
    }

    async fn list_constraints(&self, table: &TableRef) -> GuardResult<Vec<ConstraintInfo>> {
        let (schema, name) = key_of(table);
        self.with_catalog(|c| {
            c.constraints
                .iter()
                .filter(|k| k.schema == schema && k.table == name)
                .cloned()
                .collect()
        })
    }

    async fn count_rows(&self, table: &TableRef) -> GuardResult<i64> {
        self.with_catalog(|c| c.tables.get(&key_of(table)).map(|t| t.rows))?
            .ok_or_else(|| GuardError::SchemaNotFound(table.to_string()))
    }

    async fn count_referencing_rows(
        &self,
        table: &TableRef,
        columns: &[String],
    ) -> GuardResult<i64> {
        self.with_catalog(|c| {
            c.tables.get(&key_of(table)).map(|t| {
                let nulls = columns
                    .iter()
                    .filter_map(|col| t.null_rows.get(col))
                    .max()
                    .copied()
                    .unwrap_or(0);
                (t.rows - nulls.min(t.rows)).max(0)
            })
        })?
        .ok_or_else(|| GuardError::SchemaNotFound(table.to_string()))
    }
}

pub struct FakeSession {
    db: FakeDatabase,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        let mut state = self.db.lock();
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }
}

#[async_trait]
impl DbSession for FakeSession {
    async fn execute(&mut self, sql: &str) -> GuardResult<u64> {
        self.db.run(&[sql.to_string()], true).await?;
        Ok(0)
    }

    async fn transaction(&mut self, statements: &[String]) -> GuardResult<()> {
        self.db.run(statements, true).await
    }

    async fn rehearse(&mut self, statements: &[String]) -> GuardResult<()> {
        self.db.run(statements, false).await
    }
}

#[async_trait]
impl ConnectionProvider for FakeDatabase {
    async fn acquire(&self) -> GuardResult<Box<dyn DbSession>> {
        self.lock().open_sessions += 1;
        Ok(Box::new(FakeSession { db: self.clone() }))
    }

    fn active_sessions(&self) -> usize {
        self.open_sessions()
    }
}

// =============================================================================
// STAGING
// =============================================================================

/// Staging backend whose clones are independent `FakeDatabase`s
pub struct FakeStaging {
    source: FakeDatabase,
    environments: Mutex<HashMap<Uuid, Option<FakeDatabase>>>,
    replicas: Mutex<Vec<FakeDatabase>>,
    provision_delay: Mutex<Duration>,
    fail_provision: Mutex<bool>,
}

impl FakeStaging {
    pub fn new(source: FakeDatabase) -> Self {
        Self {
            source,
            environments: Mutex::new(HashMap::new()),
            replicas: Mutex::new(Vec::new()),
            provision_delay: Mutex::new(Duration::ZERO),
            fail_provision: Mutex::new(false),
        }
    }

    pub fn set_provision_delay(&self, delay: Duration) {
        *self.provision_delay.lock().expect("poisoned") = delay;
    }

    pub fn fail_provision(&self, fail: bool) {
        *self.fail_provision.lock().expect("poisoned") = fail;
    }

    /// Environments provisioned and not yet torn down
    pub fn live(&self) -> usize {
        self.environments.lock().expect("poisoned").len()
    }

    /// Every replica ever handed out, torn down or not
    pub fn replicas(&self) -> Vec<FakeDatabase> {
        self.replicas.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl StagingBackend for FakeStaging {
    async fn provision(&self, env: &StagingEnvironment) -> GuardResult<()> {
        let delay = *self.provision_delay.lock().expect("poisoned");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_provision.lock().expect("poisoned") {
            return Err(GuardError::Staging("provisioning refused".to_string()));
        }
        self.environments
            .lock()
            .expect("poisoned")
            .insert(env.id, None);
        Ok(())
    }

    async fn replicate(
        &self,
        env: &StagingEnvironment,
        include_data: bool,
    ) -> GuardResult<StagingHandle> {
        let replica = self.source.replica(env.sample_ratio, include_data);
        let mut envs = self.environments.lock().expect("poisoned");
        let slot = envs
            .get_mut(&env.id)
            .ok_or_else(|| GuardError::Staging(format!("{} not provisioned", env.id)))?;
        *slot = Some(replica.clone());
        drop(envs);
        self.replicas.lock().expect("poisoned").push(replica.clone());
        let schema = Ident::new(replica.lock().search_path.clone())?;

        Ok(StagingHandle {
            environment_id: env.id,
            connections: replica.connections(),
            introspector: replica.introspector(),
            schema,
        })
    }

    async fn teardown(&self, env: &StagingEnvironment) -> GuardResult<()> {
        self.environments.lock().expect("poisoned").remove(&env.id);
        Ok(())
    }
}

// =============================================================================
// DDL INTERPRETER
// =============================================================================

const IDENT: &str = r#"(?:"(?:[^"]|"")*"|[A-Za-z_][A-Za-z0-9_$]*)"#;

fn re(pattern: &str) -> Regex {
    let expanded = pattern
        .replace("QNAME", &format!("({IDENT}(?:\\.{IDENT})?)"))
        .replace("IDENT1", &format!("({IDENT})"));
    Regex::new(&format!("(?is)^\\s*{}\\s*$", expanded)).expect("fake interpreter regex")
}

static CREATE_TABLE_AS: Lazy<Regex> =
    Lazy::new(|| re(r"CREATE TABLE QNAME AS SELECT (.+?) FROM QNAME"));
static DROP_TABLE: Lazy<Regex> = Lazy::new(|| re(r"DROP TABLE (IF EXISTS )?QNAME"));
static DROP_COLUMN: Lazy<Regex> = Lazy::new(|| re(r"ALTER TABLE QNAME DROP COLUMN IDENT1"));
static ADD_COLUMN: Lazy<Regex> = Lazy::new(|| re(r"ALTER TABLE QNAME ADD COLUMN IDENT1 (.+)"));
static SET_NOT_NULL: Lazy<Regex> =
    Lazy::new(|| re(r"ALTER TABLE QNAME ALTER COLUMN IDENT1 SET NOT NULL"));
static SET_DEFAULT: Lazy<Regex> =
    Lazy::new(|| re(r"ALTER TABLE QNAME ALTER COLUMN IDENT1 SET DEFAULT (.+)"));
static RENAME_TABLE: Lazy<Regex> = Lazy::new(|| re(r"ALTER TABLE QNAME RENAME TO IDENT1"));
static DROP_CONSTRAINT: Lazy<Regex> =
    Lazy::new(|| re(r"ALTER TABLE QNAME DROP CONSTRAINT IDENT1"));
static ADD_FOREIGN_KEY: Lazy<Regex> = Lazy::new(|| {
    re(r"ALTER TABLE QNAME ADD CONSTRAINT IDENT1 FOREIGN KEY \((.+?)\) REFERENCES QNAME ?\((.+?)\)(.*)")
});
static ADD_CONSTRAINT: Lazy<Regex> =
    Lazy::new(|| re(r"ALTER TABLE QNAME ADD CONSTRAINT IDENT1 (.+)"));
static DROP_VIEW: Lazy<Regex> =
    Lazy::new(|| re(r"DROP (MATERIALIZED )?VIEW (IF EXISTS )?QNAME"));
static CREATE_VIEW: Lazy<Regex> =
    Lazy::new(|| re(r"CREATE (MATERIALIZED )?VIEW QNAME AS (.+)"));
static DROP_TRIGGER: Lazy<Regex> =
    Lazy::new(|| re(r"DROP TRIGGER (IF EXISTS )?IDENT1 ON QNAME"));
static CREATE_TRIGGER: Lazy<Regex> = Lazy::new(|| re(r"CREATE (OR REPLACE )?TRIGGER IDENT1 .+"));
static DROP_INDEX: Lazy<Regex> = Lazy::new(|| re(r"DROP INDEX (IF EXISTS )?QNAME"));
static CREATE_INDEX: Lazy<Regex> = Lazy::new(|| {
    re(r"CREATE (UNIQUE )?INDEX IDENT1 ON QNAME(?: USING (\w+))? \((.+?)\)(?: WHERE .+)?")
});
static INSERT_SELECT: Lazy<Regex> =
    Lazy::new(|| re(r"INSERT INTO QNAME(?: \(.+?\))? SELECT .+? FROM QNAME.*"));
static DELETE_ALL: Lazy<Regex> = Lazy::new(|| re(r"DELETE FROM QNAME"));
static SELECT_FROM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\bFROM\s+({IDENT}(?:\.{IDENT})?)")).expect("static regex")
});
static ON_DELETE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)ON DELETE (CASCADE|RESTRICT|SET NULL|SET DEFAULT|NO ACTION)")
        .expect("static regex")
});

fn is_query(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_uppercase();
    head.starts_with("SELECT") || head.starts_with("EXPLAIN") || head.starts_with("WITH")
}

fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn unquote(ident: &str) -> String {
    let ident = ident.trim();
    if ident.starts_with('"') && ident.ends_with('"') && ident.len() >= 2 {
        ident[1..ident.len() - 1].replace("\"\"", "\"")
    } else {
        ident.to_string()
    }
}

fn parse_qname(raw: &str, search_path: &str) -> Key {
    static PART: Lazy<Regex> = Lazy::new(|| Regex::new(IDENT).expect("static regex"));
    let parts: Vec<String> = PART.find_iter(raw).map(|m| unquote(m.as_str())).collect();
    match parts.as_slice() {
        [schema, name] => (schema.clone(), name.clone()),
        [name] => (search_path.to_string(), name.clone()),
        _ => (search_path.to_string(), raw.to_string()),
    }
}

fn ident_list(raw: &str) -> Vec<String> {
    raw.split(',').map(unquote).filter(|s| !s.is_empty()).collect()
}

fn fail(msg: impl Into<String>) -> GuardError {
    GuardError::Internal(msg.into())
}

fn table_mut<'a>(cat: &'a mut Catalog, key: &Key) -> GuardResult<&'a mut FakeTable> {
    cat.tables
        .get_mut(key)
        .ok_or_else(|| fail(format!("relation \"{}.{}\" does not exist", key.0, key.1)))
}

fn apply(cat: &mut Catalog, sp: &str, sql: &str) -> GuardResult<()> {
    let q = |caps: &Captures, i: usize| parse_qname(&caps[i], sp);

    if is_query(sql) {
        for caps in SELECT_FROM.captures_iter(sql) {
            let key = parse_qname(&caps[1], sp);
            let is_view = cat.views.iter().any(|v| v.info.schema == key.0 && v.info.name == key.1);
            if !cat.tables.contains_key(&key) && !is_view {
                return Err(fail(format!("relation \"{}\" does not exist", key.1)));
            }
        }
        return Ok(());
    }

    let upper = sql.trim_start().to_ascii_uppercase();
    if upper.starts_with("SET ") || upper == "BEGIN" || upper == "COMMIT" {
        return Ok(());
    }
    cat.ddl_applied += 1;

    if let Some(c) = CREATE_TABLE_AS.captures(sql) {
        let (target, source) = (q(&c, 1), q(&c, 3));
        if cat.tables.contains_key(&target) {
            return Err(fail(format!("relation \"{}\" already exists", target.1)));
        }
        let src = cat
            .tables
            .get(&source)
            .cloned()
            .ok_or_else(|| fail(format!("relation \"{}\" does not exist", source.1)))?;
        let columns = if c[2].trim() == "*" {
            src.columns.clone()
        } else {
            ident_list(&c[2])
                .iter()
                .map(|name| {
                    src.columns
                        .iter()
                        .find(|col| &col.name == name)
                        .cloned()
                        .ok_or_else(|| fail(format!("column \"{}\" does not exist", name)))
                })
                .collect::<GuardResult<_>>()?
        };
        cat.tables.insert(
            target,
            FakeTable {
                columns,
                rows: src.rows,
                null_rows: src.null_rows,
            },
        );
        return Ok(());
    }

    if let Some(c) = DROP_TABLE.captures(sql) {
        let key = q(&c, 2);
        if cat.tables.remove(&key).is_none() && c.get(1).is_none() {
            return Err(fail(format!("table \"{}\" does not exist", key.1)));
        }
        return Ok(());
    }

    if let Some(c) = DROP_COLUMN.captures(sql) {
        let key = q(&c, 1);
        let column = unquote(&c[2]);
        let table = table_mut(cat, &key)?;
        if !table.columns.iter().any(|col| col.name == column) {
            return Err(fail(format!("column \"{}\" does not exist", column)));
        }
        let blocking_view = cat.views.iter().find(|v| {
            v.base == key
                && match &v.info.referenced_columns {
                    Some(cols) => cols.contains(&column),
                    None => mentions_identifier(&v.info.definition, &column),
                }
        });
        if let Some(v) = blocking_view {
            return Err(fail(format!(
                "cannot drop column {} because view {} depends on it",
                column, v.info.name
            )));
        }
        let blocking_fk = cat.foreign_keys.iter().find(|fk| {
            fk.referenced_schema == key.0
                && fk.referenced_table == key.1
                && fk.referenced_columns.contains(&column)
        });
        if let Some(fk) = blocking_fk {
            return Err(fail(format!(
                "cannot drop column {} because constraint {} depends on it",
                column, fk.constraint_name
            )));
        }

        table_mut(cat, &key)?.columns.retain(|col| col.name != column);
        let on_table = |schema: &str, table: &str| schema == key.0 && table == key.1;
        cat.indexes.retain(|i| {
            !(on_table(&i.schema, &i.table)
                && (i.columns.contains(&column)
                    || i.expression.as_deref().map_or(false, |e| mentions_identifier(e, &column))
                    || i.predicate.as_deref().map_or(false, |p| mentions_identifier(p, &column))))
        });
        cat.constraints
            .retain(|k| !(on_table(&k.schema, &k.table) && k.columns.contains(&column)));
        cat.foreign_keys.retain(|fk| {
            !(on_table(&fk.source_schema, &fk.source_table) && fk.source_columns.contains(&column))
        });
        cat.triggers
            .retain(|t| !(on_table(&t.schema, &t.table) && t.update_columns.contains(&column)));
        return Ok(());
    }

    if let Some(c) = ADD_COLUMN.captures(sql) {
        let key = q(&c, 1);
        let column = unquote(&c[2]);
        let table = table_mut(cat, &key)?;
        if table.columns.iter().any(|col| col.name == column) {
            return Err(fail(format!("column \"{}\" already exists", column)));
        }
        table.columns.push(ColumnInfo {
            name: column,
            data_type: c[3].trim().to_string(),
            nullable: true,
            default_value: None,
            is_primary_key: false,
        });
        return Ok(());
    }

    if let Some(c) = SET_NOT_NULL.captures(sql) {
        let column = unquote(&c[2]);
        let table = table_mut(cat, &q(&c, 1))?;
        let col = table
            .columns
            .iter_mut()
            .find(|col| col.name == column)
            .ok_or_else(|| fail(format!("column \"{}\" does not exist", column)))?;
        col.nullable = false;
        return Ok(());
    }

    if let Some(c) = SET_DEFAULT.captures(sql) {
        let column = unquote(&c[2]);
        let table = table_mut(cat, &q(&c, 1))?;
        let col = table
            .columns
            .iter_mut()
            .find(|col| col.name == column)
            .ok_or_else(|| fail(format!("column \"{}\" does not exist", column)))?;
        col.default_value = Some(c[3].trim().to_string());
        return Ok(());
    }

    if let Some(c) = RENAME_TABLE.captures(sql) {
        let old = q(&c, 1);
        let new = (old.0.clone(), unquote(&c[2]));
        if cat.tables.contains_key(&new) {
            return Err(fail(format!("relation \"{}\" already exists", new.1)));
        }
        let table = cat
            .tables
            .remove(&old)
            .ok_or_else(|| fail(format!("relation \"{}\" does not exist", old.1)))?;
        cat.tables.insert(new.clone(), table);

        let is_old = |schema: &str, name: &str| schema == old.0 && name == old.1;
        for fk in &mut cat.foreign_keys {
            if is_old(&fk.source_schema, &fk.source_table) {
                fk.source_table = new.1.clone();
            }
            if is_old(&fk.referenced_schema, &fk.referenced_table) {
                fk.referenced_table = new.1.clone();
            }
        }
        for v in &mut cat.views {
            if v.base == old {
                v.base = new.clone();
            }
        }
        for i in &mut cat.indexes {
            if is_old(&i.schema, &i.table) {
                i.table = new.1.clone();
            }
        }
        for t in &mut cat.triggers {
            if is_old(&t.schema, &t.table) {
                t.table = new.1.clone();
            }
        }
        for k in &mut cat.constraints {
            if is_old(&k.schema, &k.table) {
                k.table = new.1.clone();
            }
        }
        return Ok(());
    }

    if let Some(c) = DROP_CONSTRAINT.captures(sql) {
        let key = q(&c, 1);
        let name = unquote(&c[2]);
        let before = cat.foreign_keys.len();
        cat.foreign_keys.retain(|fk| {
            !(fk.source_schema == key.0 && fk.source_table == key.1 && fk.constraint_name == name)
        });
        if cat.foreign_keys.len() < before {
            return Ok(());
        }

        let position = cat
            .constraints
            .iter()
            .position(|k| k.schema == key.0 && k.table == key.1 && k.name == name)
            .ok_or_else(|| fail(format!("constraint \"{}\" does not exist", name)))?;
        let constraint = cat.constraints.remove(position);
        if matches!(constraint.kind, ConstraintKind::PrimaryKey | ConstraintKind::Unique) {
            let referenced = cat.foreign_keys.iter().find(|fk| {
                fk.referenced_schema == key.0
                    && fk.referenced_table == key.1
                    && constraint.columns.iter().all(|col| fk.referenced_columns.contains(col))
            });
            if let Some(fk) = referenced {
                return Err(fail(format!(
                    "cannot drop constraint {} because constraint {} depends on it",
                    name, fk.constraint_name
                )));
            }
            if let Some(i) = cat.indexes.iter().position(|i| i.name == name && i.schema == key.0) {
                let index = cat.indexes.remove(i);
                cat.dropped_indexes.push(index);
            }
        }
        return Ok(());
    }

    if let Some(c) = ADD_FOREIGN_KEY.captures(sql) {
        let source = q(&c, 1);
        let referenced = q(&c, 4);
        let source_columns = ident_list(&c[3]);
        let referenced_columns = ident_list(&c[5]);
        let src = cat
            .tables
            .get(&source)
            .ok_or_else(|| fail(format!("relation \"{}\" does not exist", source.1)))?;
        let dst = cat
            .tables
            .get(&referenced)
            .ok_or_else(|| fail(format!("relation \"{}\" does not exist", referenced.1)))?;
        for col in &source_columns {
            if !src.columns.iter().any(|c| &c.name == col) {
                return Err(fail(format!("column \"{}\" does not exist", col)));
            }
        }
        for col in &referenced_columns {
            if !dst.columns.iter().any(|c| &c.name == col) {
                return Err(fail(format!("column \"{}\" does not exist", col)));
            }
        }
        let on_delete = ON_DELETE
            .captures(&c[6])
            .map(|m| match m[1].to_ascii_uppercase().as_str() {
                "CASCADE" => ReferentialAction::Cascade,
                "RESTRICT" => ReferentialAction::Restrict,
                "SET NULL" => ReferentialAction::SetNull,
                "SET DEFAULT" => ReferentialAction::SetDefault,
                _ => ReferentialAction::NoAction,
            })
            .unwrap_or_default();
        cat.foreign_keys.push(ForeignKeyInfo {
            constraint_name: unquote(&c[2]),
            source_schema: source.0,
            source_table: source.1,
            source_columns,
            referenced_schema: referenced.0,
            referenced_table: referenced.1,
            referenced_columns,
            on_update: ReferentialAction::NoAction,
            on_delete,
            validated: !c[6].to_ascii_uppercase().contains("NOT VALID"),
        });
        return Ok(());
    }

    if let Some(c) = ADD_CONSTRAINT.captures(sql) {
        let key = q(&c, 1);
        let name = unquote(&c[2]);
        let definition = c[3].trim().to_string();
        let validated = !definition.to_ascii_uppercase().contains("NOT VALID");
        let upper_def = definition.to_ascii_uppercase();
        let kind = if upper_def.starts_with("PRIMARY KEY") {
            ConstraintKind::PrimaryKey
        } else if upper_def.starts_with("UNIQUE") {
            ConstraintKind::Unique
        } else if upper_def.starts_with("EXCLUDE") {
            ConstraintKind::Exclusion
        } else {
            ConstraintKind::Check
        };

        let table = cat
            .tables
            .get(&key)
            .ok_or_else(|| fail(format!("relation \"{}\" does not exist", key.1)))?;
        let columns: Vec<String> = match kind {
            ConstraintKind::PrimaryKey | ConstraintKind::Unique => {
                let open = definition.find('(').unwrap_or(0);
                let close = definition.rfind(')').unwrap_or(definition.len());
                ident_list(definition.get(open + 1..close).unwrap_or(""))
            }
            _ => table
                .columns
                .iter()
                .filter(|col| mentions_identifier(&definition, &col.name))
                .map(|col| col.name.clone())
                .collect(),
        };
        for col in &columns {
            if !table.columns.iter().any(|c| &c.name == col) {
                return Err(fail(format!("column \"{}\" does not exist", col)));
            }
        }

        if matches!(kind, ConstraintKind::PrimaryKey | ConstraintKind::Unique) {
            if let Some(i) = cat.dropped_indexes.iter().position(|i| i.name == name) {
                let index = cat.dropped_indexes.remove(i);
                cat.indexes.push(index);
            }
        }
        cat.constraints.push(ConstraintInfo {
            name,
            schema: key.0,
            table: key.1,
            kind,
            columns,
            definition,
            validated,
        });
        return Ok(());
    }

    if let Some(c) = DROP_VIEW.captures(sql) {
        let key = q(&c, 3);
        if let Some(dependent) = cat.views.iter().find(|v| v.base == key) {
            return Err(fail(format!(
                "cannot drop view {} because view {} depends on it",
                key.1, dependent.info.name
            )));
        }
        match cat
            .views
            .iter()
            .position(|v| v.info.schema == key.0 && v.info.name == key.1)
        {
            Some(i) => {
                let view = cat.views.remove(i);
                cat.dropped_views.push(view);
            }
            None if c.get(2).is_some() => {}
            None => return Err(fail(format!("view \"{}\" does not exist", key.1))),
        }
        return Ok(());
    }

    if let Some(c) = CREATE_VIEW.captures(sql) {
        let key = q(&c, 2);
        let definition = c[3].trim().to_string();
        let view = match cat
            .dropped_views
            .iter()
            .position(|v| v.info.schema == key.0 && v.info.name == key.1)
        {
            Some(i) => {
                let mut view = cat.dropped_views.remove(i);
                view.info.definition = definition;
                view
            }
            None => {
                let base = SELECT_FROM
                    .captures(&definition)
                    .map(|m| parse_qname(&m[1], sp))
                    .ok_or_else(|| fail("view definition has no FROM clause"))?;
                FakeView {
                    info: ViewInfo {
                        schema: key.0.clone(),
                        name: key.1.clone(),
                        is_materialized: c.get(1).is_some(),
                        definition,
                        referenced_columns: None,
                    },
                    base,
                }
            }
        };
        let base_exists = cat.tables.contains_key(&view.base)
            || cat.views.iter().any(|v| (v.info.schema.clone(), v.info.name.clone()) == view.base);
        if !base_exists {
            return Err(fail(format!("relation \"{}\" does not exist", view.base.1)));
        }
        if let (Some(cols), Some(base)) = (&view.info.referenced_columns, cat.tables.get(&view.base)) {
            if let Some(missing) = cols.iter().find(|c| !base.columns.iter().any(|b| &b.name == *c)) {
                return Err(fail(format!("column \"{}\" does not exist", missing)));
            }
        }
        cat.views.push(view);
        return Ok(());
    }

    if let Some(c) = DROP_TRIGGER.captures(sql) {
        let name = unquote(&c[2]);
        let key = q(&c, 3);
        match cat
            .triggers
            .iter()
            .position(|t| t.name == name && t.schema == key.0 && t.table == key.1)
        {
            Some(i) => {
                let trigger = cat.triggers.remove(i);
                cat.dropped_triggers.push(trigger);
            }
            None if c.get(1).is_some() => {}
            None => return Err(fail(format!("trigger \"{}\" does not exist", name))),
        }
        return Ok(());
    }

    if let Some(c) = CREATE_TRIGGER.captures(sql) {
        let name = unquote(&c[2]);
        let i = cat
            .dropped_triggers
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| fail(format!("unknown trigger function for \"{}\"", name)))?;
        let trigger = cat.dropped_triggers.remove(i);
        cat.triggers.push(trigger);
        return Ok(());
    }

    if let Some(c) = DROP_INDEX.captures(sql) {
        let key = q(&c, 2);
        match cat
            .indexes
            .iter()
            .position(|i| i.schema == key.0 && i.name == key.1)
        {
            Some(i) => {
                let index = cat.indexes.remove(i);
                cat.dropped_indexes.push(index);
            }
            None if c.get(1).is_some() => {}
            None => return Err(fail(format!("index \"{}\" does not exist", key.1))),
        }
        return Ok(());
    }

    if let Some(c) = CREATE_INDEX.captures(sql) {
        let name = unquote(&c[2]);
        let key = q(&c, 3);
        let table = cat
            .tables
            .get(&key)
            .ok_or_else(|| fail(format!("relation \"{}\" does not exist", key.1)))?;
        let index = match cat
            .dropped_indexes
            .iter()
            .position(|i| i.name == name && i.definition.trim() == sql.trim())
        {
            Some(i) => cat.dropped_indexes.remove(i),
            None => IndexInfo {
                name: name.clone(),
                schema: key.0.clone(),
                table: key.1.clone(),
                columns: ident_list(&c[5]),
                is_unique: c.get(1).is_some(),
                is_primary: false,
                index_type: c.get(4).map_or("btree".to_string(), |m| m.as_str().to_string()),
                expression: None,
                predicate: None,
                definition: sql.trim().to_string(),
            },
        };
        if let Some(missing) = index
            .columns
            .iter()
            .find(|col| !table.columns.iter().any(|c| &c.name == *col))
        {
            return Err(fail(format!("column \"{}\" does not exist", missing)));
        }
        cat.indexes.push(index);
        return Ok(());
    }

    if let Some(c) = INSERT_SELECT.captures(sql) {
        let rows = cat
            .tables
            .get(&q(&c, 2))
            .map(|t| t.rows)
            .ok_or_else(|| fail("source relation does not exist"))?;
        table_mut(cat, &q(&c, 1))?.rows += rows;
        return Ok(());
    }

    if let Some(c) = DELETE_ALL.captures(sql) {
        table_mut(cat, &q(&c, 1))?.rows = 0;
        return Ok(());
    }

    // UPDATE and anything else: accepted, catalog unchanged
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableRef {
        TableRef::new("public", "users").unwrap()
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let db = FakeDatabase::with_users_and_orders(ReferentialAction::Cascade);
        let before = db.fingerprint();
        let mut session = db.acquire().await.unwrap();
        let result = session
            .transaction(&[
                r#"ALTER TABLE "public"."users" DROP COLUMN "deprecated_field""#.to_string(),
                r#"ALTER TABLE "public"."users" DROP COLUMN "missing""#.to_string(),
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(db.fingerprint(), before);
        drop(session);
        assert_eq!(db.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_drop_column_blocked_by_incoming_fk() {
        let db = FakeDatabase::with_users_and_orders(ReferentialAction::Cascade);
        let mut session = db.acquire().await.unwrap();
        assert!(session
            .execute(r#"ALTER TABLE "public"."users" DROP COLUMN "id""#)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rename_moves_references() {
        let db = FakeDatabase::with_users_and_orders(ReferentialAction::Restrict);
        let mut session = db.acquire().await.unwrap();
        session
            .execute(r#"ALTER TABLE "public"."users" RENAME TO "accounts""#)
            .await
            .unwrap();
        let accounts = TableRef::new("public", "accounts").unwrap();
        assert!(!db.table_exists(&users()).await.unwrap());
        let fks = db.list_foreign_keys(&accounts).await.unwrap();
        assert_eq!(fks[0].referenced_table, "accounts");
    }

    #[tokio::test]
    async fn test_rehearse_never_commits() {
        let db = FakeDatabase::with_users_and_orders(ReferentialAction::Cascade);
        let before = db.fingerprint();
        let mut session = db.acquire().await.unwrap();
        session
            .rehearse(&[r#"ALTER TABLE users DROP COLUMN deprecated_field"#.to_string()])
            .await
            .unwrap();
        assert_eq!(db.fingerprint(), before);
    }
}
