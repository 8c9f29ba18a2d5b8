use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("{0}")]
    PolicyViolation(String),

    #[error("SQL generation failed: {0}")]
    Generation(String),

    #[error("{0}")]
    Execution(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("History error: {0}")]
    History(String),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQL error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<csv::Error> for QueryError {
    fn from(err: csv::Error) -> Self {
        QueryError::Csv(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
