//! PostgreSQL adapter

use super::{execution_error, not_connected, text_cell_to_json, timeout_error, DatabaseAdapter, Dialect, QueryOutput, Row};
use crate::error::{QueryError, Result};
use crate::schema::{Column, ForeignKey, Schema, Table};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as _, Executor, Row as _, TypeInfo as _};
use std::time::Duration;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side slack on top of the server-side statement timeout, so the
/// database's own cancellation error normally wins.
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

pub struct PostgresAdapter {
    url: String,
    pool: Option<PgPool>,
}

impl PostgresAdapter {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            pool: None,
        }
    }

    fn pool(&self) -> Result<&PgPool> {
        self.pool.as_ref().ok_or_else(not_connected)
    }

    async fn load_table(&self, pool: &PgPool, name: String) -> Result<Table> {
        let columns: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text, is_nullable::text, column_default::text
            FROM information_schema.columns
            WHERE table_schema = 'public' AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;

        let primary_key: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            WHERE tc.constraint_type = 'PRIMARY KEY'
              AND tc.table_schema = 'public'
              AND tc.table_name = $1
            ORDER BY kcu.ordinal_position
            "#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;
        let primary_key: Vec<String> = primary_key.into_iter().map(|(c,)| c).collect();

        let foreign_keys: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT kcu.column_name::text, ccu.table_name::text, ccu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON tc.constraint_name = ccu.constraint_name
             AND tc.table_schema = ccu.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = 'public'
              AND tc.table_name = $1
            ORDER BY kcu.ordinal_position
            "#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;

        // Planner estimate; -1 for tables that were never analyzed
        let row_count: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT c.reltuples::int8
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = 'public' AND c.relname = $1
            "#,
        )
        .bind(&name)
        .fetch_optional(pool)
        .await?;

        let columns = columns
            .into_iter()
            .map(|(column_name, data_type, is_nullable, default_value)| Column {
                is_primary_key: primary_key.contains(&column_name),
                name: column_name,
                data_type,
                nullable: is_nullable == "YES",
                default_value,
            })
            .collect();

        let mut table = Table::new(name, columns);
        if !primary_key.is_empty() {
            table.primary_key = Some(primary_key);
        }
        if !foreign_keys.is_empty() {
            table.foreign_keys = Some(
                foreign_keys
                    .into_iter()
                    .map(|(column, ref_table, ref_column)| ForeignKey::new(column, ref_table, ref_column))
                    .collect(),
            );
        }
        table.row_count = row_count.and_then(|(n,)| u64::try_from(n).ok());
        Ok(table)
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn connect(&mut self) -> Result<()> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(&self.url)
            .await
            .map_err(|e| QueryError::Database(format!("Failed to connect to PostgreSQL: {}", e)))?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        info!("Connected to PostgreSQL");
        self.pool = Some(pool);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
            debug!("PostgreSQL pool closed");
        }
        Ok(())
    }

    async fn get_schema(&self) -> Result<Schema> {
        let pool = self.pool()?;

        let names: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .fetch_all(pool)
        .await?;

        let mut tables = Vec::with_capacity(names.len());
        for (name,) in names {
            tables.push(self.load_table(pool, name).await?);
        }

        info!("Introspected {} PostgreSQL tables", tables.len());
        Ok(Schema::new(tables))
    }

    async fn execute_query(&self, sql: &str, timeout: Duration, max_rows: usize) -> Result<QueryOutput> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await.map_err(execution_error)?;

        let set_timeout = format!("SET statement_timeout = {}", timeout.as_millis());
        (&mut *conn).execute(set_timeout.as_str()).await.map_err(execution_error)?;

        match tokio::time::timeout(timeout + TIMEOUT_GRACE, read_rows(&mut conn, sql, max_rows)).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(timeout)),
        }
    }

    async fn check_write_access(&self) -> Result<bool> {
        let pool = self.pool()?;

        let (privileges,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)::int8
            FROM information_schema.table_privileges
            WHERE grantee = current_user
              AND privilege_type IN ('INSERT', 'UPDATE', 'DELETE')
            "#,
        )
        .fetch_one(pool)
        .await?;

        let (superuser,): (i64,) =
            sqlx::query_as("SELECT COUNT(*)::int8 FROM pg_roles WHERE rolname = current_user AND rolsuper")
                .fetch_one(pool)
                .await?;

        Ok(privileges > 0 || superuser > 0)
    }
}

/// Stream rows over the simple query protocol, stopping at `max_rows`.
async fn read_rows(conn: &mut PgConnection, sql: &str, max_rows: usize) -> Result<QueryOutput> {
    let mut rows = Vec::new();
    let mut columns: Vec<String> = Vec::new();

    {
        let mut stream = (&mut *conn).fetch(sql);
        while let Some(row) = stream.try_next().await.map_err(execution_error)? {
            if columns.is_empty() {
                columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            rows.push(row_to_json(&row));
            if rows.len() >= max_rows {
                debug!("Row cap of {} reached, dropping remaining rows", max_rows);
                break;
            }
        }
    }

    if columns.is_empty() {
        if let Ok(described) = (&mut *conn).describe(sql).await {
            columns = described.columns().iter().map(|c| c.name().to_string()).collect();
        }
    }

    Ok(QueryOutput { rows, columns })
}

fn row_to_json(row: &PgRow) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_unchecked::<Option<&str>, _>(idx).ok().flatten();
        out.insert(column.name().to_string(), text_cell_to_json(raw, column.type_info().name()));
    }
    out
}
