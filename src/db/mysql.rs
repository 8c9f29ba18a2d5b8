//! MySQL adapter

use super::{execution_error, not_connected, text_cell_to_json, timeout_error, DatabaseAdapter, Dialect, QueryOutput, Row};
use crate::error::{QueryError, Result};
use crate::schema::{Column, ForeignKey, Schema, Table};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlConnection, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column as _, Executor, Row as _, TypeInfo as _};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

pub struct MySqlAdapter {
    url: String,
    pool: Option<MySqlPool>,
}

impl MySqlAdapter {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            pool: None,
        }
    }

    fn pool(&self) -> Result<&MySqlPool> {
        self.pool.as_ref().ok_or_else(not_connected)
    }

    async fn current_database(&self, pool: &MySqlPool) -> Result<String> {
        let (database,): (Option<String>,) = sqlx::query_as("SELECT DATABASE()").fetch_one(pool).await?;
        database.ok_or_else(|| QueryError::Database("No database selected in connection URL".to_string()))
    }

    async fn load_table(&self, pool: &MySqlPool, database: &str, name: String, row_count: Option<i64>) -> Result<Table> {
        let columns: Vec<(String, String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT CAST(column_name AS CHAR), CAST(data_type AS CHAR), CAST(is_nullable AS CHAR),
                   CAST(column_key AS CHAR), CAST(column_default AS CHAR)
            FROM information_schema.columns
            WHERE table_schema = ? AND table_name = ?
            ORDER BY ordinal_position
            "#,
        )
        .bind(database)
        .bind(&name)
        .fetch_all(pool)
        .await?;

        let foreign_keys: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT CAST(column_name AS CHAR), CAST(referenced_table_name AS CHAR),
                   CAST(referenced_column_name AS CHAR)
            FROM information_schema.key_column_usage
            WHERE table_schema = ? AND table_name = ? AND referenced_table_name IS NOT NULL
            ORDER BY ordinal_position
            "#,
        )
        .bind(database)
        .bind(&name)
        .fetch_all(pool)
        .await?;

        let mut primary_key = Vec::new();
        let columns = columns
            .into_iter()
            .map(|(column_name, data_type, is_nullable, column_key, default_value)| {
                let is_primary_key = column_key == "PRI";
                if is_primary_key {
                    primary_key.push(column_name.clone());
                }
                Column {
                    name: column_name,
                    data_type,
                    nullable: is_nullable == "YES",
                    is_primary_key,
                    default_value,
                }
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
        table.row_count = row_count.and_then(|n| u64::try_from(n).ok());
        Ok(table)
    }
}

#[async_trait]
impl DatabaseAdapter for MySqlAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn connect(&mut self) -> Result<()> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(&self.url)
            .await
            .map_err(|e| QueryError::Database(format!("Failed to connect to MySQL: {}", e)))?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        info!("Connected to MySQL");
        self.pool = Some(pool);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
            debug!("MySQL pool closed");
        }
        Ok(())
    }

    async fn get_schema(&self) -> Result<Schema> {
        let pool = self.pool()?;
        let database = self.current_database(pool).await?;

        // table_rows is an estimate for InnoDB
        let names: Vec<(String, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT CAST(table_name AS CHAR), CAST(table_rows AS SIGNED)
            FROM information_schema.tables
            WHERE table_schema = ? AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .bind(&database)
        .fetch_all(pool)
        .await?;

        let mut tables = Vec::with_capacity(names.len());
        for (name, row_count) in names {
            tables.push(self.load_table(pool, &database, name, row_count).await?);
        }

        info!("Introspected {} MySQL tables in {}", tables.len(), database);
        Ok(Schema::new(tables))
    }

    async fn execute_query(&self, sql: &str, timeout: Duration, max_rows: usize) -> Result<QueryOutput> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await.map_err(execution_error)?;

        // Only bounds SELECT statements; the client-side timeout covers the rest
        let set_timeout = format!("SET SESSION MAX_EXECUTION_TIME = {}", timeout.as_millis());
        (&mut *conn).execute(set_timeout.as_str()).await.map_err(execution_error)?;

        match tokio::time::timeout(timeout + TIMEOUT_GRACE, read_rows(&mut conn, sql, max_rows)).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(timeout)),
        }
    }

    async fn check_write_access(&self) -> Result<bool> {
        let pool = self.pool()?;

        let checked: std::result::Result<(i64,), sqlx::Error> = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM information_schema.table_privileges
            WHERE grantee LIKE CONCAT('%', SUBSTRING_INDEX(CURRENT_USER(), '@', 1), '%')
              AND privilege_type IN ('INSERT', 'UPDATE', 'DELETE')
              AND table_schema = DATABASE()
            "#,
        )
        .fetch_one(pool)
        .await;

        match checked {
            Ok((privileges,)) => Ok(privileges > 0),
            Err(e) => {
                // Privilege tables are not always readable
                warn!("Could not read MySQL privileges, assuming write access: {}", e);
                Ok(true)
            }
        }
    }
}

/// Stream rows over the text protocol, stopping at `max_rows`.
async fn read_rows(conn: &mut MySqlConnection, sql: &str, max_rows: usize) -> Result<QueryOutput> {
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

fn row_to_json(row: &MySqlRow) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_unchecked::<Option<&str>, _>(idx).ok().flatten();
        out.insert(column.name().to_string(), text_cell_to_json(raw, column.type_info().name()));
    }
    out
}
