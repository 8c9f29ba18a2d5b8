pub mod anonymizer;
pub mod cache;
pub mod db;
pub mod error;
pub mod execution_loop;
pub mod export;
pub mod history;
pub mod llm;
pub mod schema;
pub mod security;

pub use error::{QueryError, Result};
pub use execution_loop::{PipelineConfig, QueryOrchestrator, QueryRequest, QueryResponse};
