//! Database adapters
//!
//! Thin `sqlx` drivers for PostgreSQL and MySQL behind one async trait. The
//! query pipeline only talks to [`DatabaseAdapter`]; the dialect is passed
//! through to the SQL generator and never interpreted here beyond choosing a
//! driver.

pub mod mysql;
pub mod postgres;

pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;

use crate::error::{QueryError, Result};
use crate::schema::Schema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// One result row, keyed by column name
pub type Row = serde_json::Map<String, Value>;

/// Rows and column names returned by a statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    #[serde(rename = "postgresql")]
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
}

impl Dialect {
    /// Guess the dialect from a connection URL scheme.
    pub fn detect(url: &str) -> Option<Self> {
        if url.starts_with("postgresql://") || url.starts_with("postgres://") {
            Some(Dialect::Postgres)
        } else if url.starts_with("mysql://") {
            Some(Dialect::MySql)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgresql",
            Dialect::MySql => "mysql",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Dialect {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::MySql),
            other => Err(QueryError::Config(format!("Unsupported database type: {}", other))),
        }
    }
}

/// Connection to one database for the lifetime of a request
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn connect(&mut self) -> Result<()>;

    /// Release the session. Safe to call when not connected.
    async fn disconnect(&mut self) -> Result<()>;

    async fn get_schema(&self) -> Result<Schema>;

    /// Run one statement, failing if it does not finish within `timeout`.
    /// At most `max_rows` rows are read back.
    async fn execute_query(&self, sql: &str, timeout: Duration, max_rows: usize) -> Result<QueryOutput>;

    async fn check_write_access(&self) -> Result<bool>;
}

pub fn create_adapter(dialect: Dialect, url: &str) -> Box<dyn DatabaseAdapter> {
    match dialect {
        Dialect::Postgres => Box::new(PostgresAdapter::new(url)),
        Dialect::MySql => Box::new(MySqlAdapter::new(url)),
    }
}

/// Schema and access level discovered when connecting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub schema: Schema,
    pub is_read_only: bool,
    pub db_type: Dialect,
}

/// Connect, introspect, and disconnect again on every path.
pub async fn connect_and_describe(adapter: &mut dyn DatabaseAdapter) -> Result<ConnectionInfo> {
    adapter.connect().await?;

    let described = async {
        let schema = adapter.get_schema().await?;
        let has_write_access = adapter.check_write_access().await?;
        Ok::<_, QueryError>((schema, has_write_access))
    }
    .await;

    if let Err(e) = adapter.disconnect().await {
        warn!("Failed to disconnect after schema introspection: {}", e);
    }

    let (schema, has_write_access) = described?;
    Ok(ConnectionInfo {
        schema,
        is_read_only: !has_write_access,
        db_type: adapter.dialect(),
    })
}

/// Map a driver error to an execution failure carrying the database's own
/// message, which is what the repair step needs to see.
pub(crate) fn execution_error(e: sqlx::Error) -> QueryError {
    match e {
        sqlx::Error::Database(db) => QueryError::Execution(db.message().to_string()),
        other => QueryError::Execution(other.to_string()),
    }
}

pub(crate) fn timeout_error(timeout: Duration) -> QueryError {
    QueryError::Execution(format!("Query timed out after {} ms", timeout.as_millis()))
}

pub(crate) fn not_connected() -> QueryError {
    QueryError::Database("Not connected".to_string())
}

/// Convert a text-protocol cell to JSON using the column's type name.
///
/// Both drivers run generated statements over the text protocol, so every
/// cell arrives as a string regardless of its declared type.
pub fn text_cell_to_json(raw: Option<&str>, type_name: &str) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    let ty = type_name.to_ascii_uppercase();

    if ty == "BOOL" || ty == "BOOLEAN" {
        return match raw {
            "t" | "true" | "1" => Value::Bool(true),
            "f" | "false" | "0" => Value::Bool(false),
            other => Value::String(other.to_string()),
        };
    }

    if ty.contains("INT") && !ty.contains("INTERVAL") && !ty.contains("POINT") || ty == "OID" {
        if let Ok(n) = raw.parse::<i64>() {
            return Value::from(n);
        }
        if let Ok(n) = raw.parse::<u64>() {
            return Value::from(n);
        }
        return Value::String(raw.to_string());
    }

    if matches!(
        ty.as_str(),
        "FLOAT4" | "FLOAT8" | "FLOAT" | "DOUBLE" | "REAL" | "NUMERIC" | "DECIMAL"
    ) || ty.starts_with("DECIMAL")
        || ty.starts_with("DOUBLE")
    {
        return raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string()));
    }

    if ty == "JSON" || ty == "JSONB" {
        return serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    }

    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detect_dialect() {
        assert_eq!(Dialect::detect("postgres://u@h/db"), Some(Dialect::Postgres));
        assert_eq!(Dialect::detect("postgresql://u@h/db"), Some(Dialect::Postgres));
        assert_eq!(Dialect::detect("mysql://u@h/db"), Some(Dialect::MySql));
        assert_eq!(Dialect::detect("sqlite://x.db"), None);
    }

    #[test]
    fn test_dialect_serde_names() {
        assert_eq!(serde_json::to_string(&Dialect::Postgres).unwrap(), "\"postgresql\"");
        let d: Dialect = serde_json::from_str("\"mysql\"").unwrap();
        assert_eq!(d, Dialect::MySql);
        assert!("oracle".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_text_cells() {
        assert_eq!(text_cell_to_json(None, "INT4"), Value::Null);
        assert_eq!(text_cell_to_json(Some("42"), "INT8"), json!(42));
        assert_eq!(text_cell_to_json(Some("18446744073709551615"), "BIGINT UNSIGNED"), json!(18446744073709551615u64));
        assert_eq!(text_cell_to_json(Some("12.50"), "NUMERIC"), json!(12.5));
        assert_eq!(text_cell_to_json(Some("3.25"), "DECIMAL"), json!(3.25));
        assert_eq!(text_cell_to_json(Some("NaN"), "NUMERIC"), json!("NaN"));
        assert_eq!(text_cell_to_json(Some("t"), "BOOL"), json!(true));
        assert_eq!(text_cell_to_json(Some("{\"a\":1}"), "JSONB"), json!({"a": 1}));
        assert_eq!(text_cell_to_json(Some("1 day"), "INTERVAL"), json!("1 day"));
        assert_eq!(text_cell_to_json(Some("2024-01-01"), "DATE"), json!("2024-01-01"));
    }
}
