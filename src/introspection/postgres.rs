//! PostgreSQL catalog introspection
//!
//! Queries `pg_catalog` directly: `information_schema` hides expression indexes, exclusion
//! constraints and column-level view dependencies. Schema and table names are always bound
//! as `$1`/`$2`.

use super::{
    ColumnInfo, ConstraintInfo, ConstraintKind, ForeignKeyInfo, IndexInfo, ReferentialAction,
    SchemaIntrospector, TriggerInfo, ViewInfo,
};
use crate::error::GuardError;
use crate::sql::{quote_ident, TableRef};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use tracing::debug;

const TABLE_EXISTS: &str = r#"
    SELECT EXISTS (
        SELECT 1
        FROM pg_catalog.pg_class c
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')
    ) AS found
"#;

const LIST_COLUMNS: &str = r#"
    SELECT
        a.attname::text AS column_name,
        format_type(a.atttypid, a.atttypmod) AS data_type,
        NOT a.attnotnull AS nullable,
        pg_get_expr(d.adbin, d.adrelid) AS column_default,
        COALESCE(a.attnum = ANY(pk.conkey), false) AS is_primary_key
    FROM pg_catalog.pg_attribute a
    JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
    LEFT JOIN pg_catalog.pg_constraint pk ON pk.conrelid = c.oid AND pk.contype = 'p'
    WHERE n.nspname = $1 AND c.relname = $2
      AND a.attnum > 0 AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

const LIST_FOREIGN_KEYS: &str = r#"
    SELECT
        con.conname::text AS constraint_name,
        sn.nspname::text AS source_schema,
        sc.relname::text AS source_table,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS source_columns,
        tn.nspname::text AS referenced_schema,
        tc.relname::text AS referenced_table,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS referenced_columns,
        con.confupdtype::text AS on_update,
        con.confdeltype::text AS on_delete,
        con.convalidated AS validated
    FROM pg_catalog.pg_constraint con
    JOIN pg_catalog.pg_class sc ON sc.oid = con.conrelid
    JOIN pg_catalog.pg_namespace sn ON sn.oid = sc.relnamespace
    JOIN pg_catalog.pg_class tc ON tc.oid = con.confrelid
    JOIN pg_catalog.pg_namespace tn ON tn.oid = tc.relnamespace
    WHERE con.contype = 'f'
      AND ((sn.nspname = $1 AND sc.relname = $2) OR (tn.nspname = $1 AND tc.relname = $2))
    ORDER BY sn.nspname, sc.relname, con.conname
"#;

const LIST_INDEXES: &str = r#"
    SELECT
        i.relname::text AS index_name,
        n.nspname::text AS schema_name,
        t.relname::text AS table_name,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            WHERE k.attnum > 0
            ORDER BY k.ord
        ) AS columns,
        ix.indisunique AS is_unique,
        ix.indisprimary AS is_primary,
        am.amname::text AS index_type,
        pg_get_expr(ix.indexprs, ix.indrelid) AS expression,
        pg_get_expr(ix.indpred, ix.indrelid) AS predicate,
        pg_get_indexdef(ix.indexrelid) AS definition
    FROM pg_catalog.pg_index ix
    JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
    JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_am am ON am.oid = i.relam
    WHERE n.nspname = $1 AND t.relname = $2
    ORDER BY i.relname
"#;

const LIST_VIEWS: &str = r#"
    SELECT
        vn.nspname::text AS view_schema,
        v.relname::text AS view_name,
        v.relkind = 'm' AS is_materialized,
        pg_get_viewdef(v.oid, true) AS definition,
        COALESCE(
            array_agg(DISTINCT a.attname::text) FILTER (WHERE a.attname IS NOT NULL),
            ARRAY[]::text[]
        ) AS referenced_columns
    FROM pg_catalog.pg_depend d
    JOIN pg_catalog.pg_rewrite r ON r.oid = d.objid
    JOIN pg_catalog.pg_class v ON v.oid = r.ev_class
    JOIN pg_catalog.pg_namespace vn ON vn.oid = v.relnamespace
    JOIN pg_catalog.pg_class t ON t.oid = d.refobjid
    JOIN pg_catalog.pg_namespace tn ON tn.oid = t.relnamespace
    LEFT JOIN pg_catalog.pg_attribute a
        ON a.attrelid = t.oid AND d.refobjsubid > 0 AND a.attnum = d.refobjsubid
    WHERE d.classid = 'pg_catalog.pg_rewrite'::regclass
      AND d.refclassid = 'pg_catalog.pg_class'::regclass
      AND tn.nspname = $1 AND t.relname = $2
      AND v.oid <> t.oid
      AND v.relkind IN ('v', 'm')
    GROUP BY vn.nspname, v.relname, v.relkind, v.oid
    ORDER BY vn.nspname, v.relname
"#;

const LIST_TRIGGERS: &str = r#"
    SELECT
        tg.tgname::text AS trigger_name,
        n.nspname::text AS schema_name,
        t.relname::text AS table_name,
        p.proname::text AS function_name,
        COALESCE(p.prosrc, '') AS function_body,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(tg.tgattr::int2[]) AS k(attnum)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
        ) AS update_columns,
        pg_get_triggerdef(tg.oid) AS definition
    FROM pg_catalog.pg_trigger tg
    JOIN pg_catalog.pg_class t ON t.oid = tg.tgrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_proc p ON p.oid = tg.tgfoid
    WHERE NOT tg.tgisinternal AND n.nspname = $1 AND t.relname = $2
    ORDER BY tg.tgname
"#;

const LIST_CONSTRAINTS: &str = r#"
    SELECT
        con.conname::text AS constraint_name,
        n.nspname::text AS schema_name,
        t.relname::text AS table_name,
        con.contype::text AS kind,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS columns,
        pg_get_constraintdef(con.oid) AS definition,
        con.convalidated AS validated
    FROM pg_catalog.pg_constraint con
    JOIN pg_catalog.pg_class t ON t.oid = con.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    WHERE con.contype IN ('p', 'u', 'c', 'x') AND n.nspname = $1 AND t.relname = $2
    ORDER BY con.conname
"#;

const ESTIMATE_ROWS: &str = r#"
    SELECT c.reltuples::bigint AS estimate
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relname = $2
"#;

/// Schema introspector for PostgreSQL
#[derive(Clone)]
pub struct PgIntrospector {
    pool: Pool,
}

impl PgIntrospector {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaIntrospector for PgIntrospector {
    async fn table_exists(&self, table: &TableRef) -> Result<bool, GuardError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(TABLE_EXISTS, &[&table.schema.as_str(), &table.name.as_str()])
            .await?;
        Ok(row.get("found"))
    }

    async fn list_columns(&self, table: &TableRef) -> Result<Vec<ColumnInfo>, GuardError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(LIST_COLUMNS, &[&table.schema.as_str(), &table.name.as_str()])
            .await?;

        Ok(rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                nullable: row.get("nullable"),
                default_value: row.get("column_default"),
                is_primary_key: row.get("is_primary_key"),
            })
            .collect())
    }

    async fn list_foreign_keys(&self, table: &TableRef) -> Result<Vec<ForeignKeyInfo>, GuardError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(LIST_FOREIGN_KEYS, &[&table.schema.as_str(), &table.name.as_str()])
            .await?;

        let foreign_keys: Vec<ForeignKeyInfo> = rows
            .iter()
            .map(|row| ForeignKeyInfo {
                constraint_name: row.get("constraint_name"),
                source_schema: row.get("source_schema"),
                source_table: row.get("source_table"),
                source_columns: row.try_get("source_columns").unwrap_or_default(),
                referenced_schema: row.get("referenced_schema"),
                referenced_table: row.get("referenced_table"),
                referenced_columns: row.try_get("referenced_columns").unwrap_or_default(),
                on_update: ReferentialAction::from_pg_code(row.get("on_update")),
                on_delete: ReferentialAction::from_pg_code(row.get("on_delete")),
                validated: row.get("validated"),
            })
            .collect();

        debug!("{} foreign keys touch {}", foreign_keys.len(), table);
        Ok(foreign_keys)
    }

    async fn list_indexes(&self, table: &TableRef) -> Result<Vec<IndexInfo>, GuardError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(LIST_INDEXES, &[&table.schema.as_str(), &table.name.as_str()])
            .await?;

        Ok(rows
            .iter()
            .map(|row| IndexInfo {
                name: row.get("index_name"),
                schema: row.get("schema_name"),
                table: row.get("table_name"),
                columns: row.try_get("columns").unwrap_or_default(),
                is_unique: row.get("is_unique"),
                is_primary: row.get("is_primary"),
                index_type: row.get("index_type"),
                expression: row.get("expression"),
                predicate: row.get("predicate"),
                definition: row.get("definition"),
            })
            .collect())
    }

    async fn list_views(&self, table: &TableRef) -> Result<Vec<ViewInfo>, GuardError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(LIST_VIEWS, &[&table.schema.as_str(), &table.name.as_str()])
            .await?;

        Ok(rows
            .iter()
            .map(|row| ViewInfo {
                schema: row.get("view_schema"),
                name: row.get("view_name"),
                is_materialized: row.get("is_materialized"),
                definition: row.get("definition"),
                referenced_columns: row.try_get("referenced_columns").ok(),
            })
            .collect())
    }

    async fn list_triggers(&self, table: &TableRef) -> Result<Vec<TriggerInfo>, GuardError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(LIST_TRIGGERS, &[&table.schema.as_str(), &table.name.as_str()])
            .await?;

        Ok(rows
            .iter()
            .map(|row| TriggerInfo {
                name: row.get("trigger_name"),
                schema: row.get("schema_name"),
                table: row.get("table_name"),
                function_name: row.get("function_name"),
                function_body: row.get("function_body"),
                update_columns: row.try_get("update_columns").unwrap_or_default(),
                definition: row.get("definition"),
            })
            .collect())
    }

    async fn list_constraints(&self, table: &TableRef) -> Result<Vec<ConstraintInfo>, GuardError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(LIST_CONSTRAINTS, &[&table.schema.as_str(), &table.name.as_str()])
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let kind = ConstraintKind::from_pg_code(row.get("kind"))?;
                Some(ConstraintInfo {
                    name: row.get("constraint_name"),
                    schema: row.get("schema_name"),
                    table: row.get("table_name"),
                    kind,
                    columns: row.try_get("columns").unwrap_or_default(),
                    definition: row.get("definition"),
                    validated: row.get("validated"),
                })
            })
            .collect())
    }

    async fn count_rows(&self, table: &TableRef) -> Result<i64, GuardError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT count(*) AS total FROM {}", table.quoted());
        let row = client.query_one(&query, &[]).await?;
        Ok(row.get("total"))
    }

    async fn count_referencing_rows(
        &self,
        table: &TableRef,
        columns: &[String],
    ) -> Result<i64, GuardError> {
        if columns.is_empty() {
            return self.count_rows(table).await;
        }
        let predicate = columns
            .iter()
            .map(|c| format!("{} IS NOT NULL", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT count(*) AS total FROM {} WHERE {}",
            table.quoted(),
            predicate
        );
        let row = client.query_one(&query, &[]).await?;
        Ok(row.get("total"))
    }

    async fn estimate_rows(&self, table: &TableRef) -> Result<i64, GuardError> {
        let estimate = {
            let client = self.pool.get().await?;
            client
                .query_opt(ESTIMATE_ROWS, &[&table.schema.as_str(), &table.name.as_str()])
                .await?
                .map(|row| row.get::<_, i64>("estimate"))
        };

        match estimate {
            // Never analyzed (-1 on PG14+, 0 before): fall back to counting
            Some(n) if n > 0 => Ok(n),
            Some(_) => self.count_rows(table).await,
            None => Ok(0),
        }
    }
}
