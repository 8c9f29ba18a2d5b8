//! Query Orchestrator
//!
//! Bounded generate → validate → execute → repair loop. One orchestrator is
//! shared by all requests; everything mutable about a request lives on the
//! stack of [`QueryOrchestrator::run`].

use crate::anonymizer::{anonymize, AnonymizationMap};
use crate::cache::{CachedResult, QueryCache};
use crate::db::{DatabaseAdapter, Dialect, QueryOutput, Row};
use crate::error::{QueryError, Result};
use crate::execution_loop::error_classifier::ErrorClassifier;
use crate::history::HistorySink;
use crate::llm::{strip_code_fences, SqlGenerator, SqlRepairer, Summarizer};
use crate::schema::Schema;
use crate::security::{validate_sql, Policy, QueryGuards};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_REPAIRS: u32 = 2;

/// Pipeline limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Repair attempts after the first execution
    pub max_repairs: u32,
    pub guards: QueryGuards,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_repairs: DEFAULT_MAX_REPAIRS,
            guards: QueryGuards::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `HUMANQL_MAX_REPAIRS`, `HUMANQL_RESULT_LIMIT`,
    /// `HUMANQL_ROW_CAP` and `HUMANQL_STATEMENT_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_u32("HUMANQL_MAX_REPAIRS")? {
            config.max_repairs = v;
        }
        if let Some(v) = env_number("HUMANQL_RESULT_LIMIT")? {
            config.guards.result_limit = v;
        }
        if let Some(v) = env_number("HUMANQL_ROW_CAP")? {
            config.guards.row_cap = usize::try_from(v)
                .map_err(|_| QueryError::Config(format!("HUMANQL_ROW_CAP is out of range: {}", v)))?;
        }
        if let Some(v) = env_number("HUMANQL_STATEMENT_TIMEOUT_MS")? {
            config.guards.statement_timeout = Duration::from_millis(v);
        }
        Ok(config)
    }

    pub fn max_executions(&self) -> u32 {
        self.max_repairs.saturating_add(1)
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| QueryError::Config(format!("{} must be a non-negative integer, got '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    env_number(name)?
        .map(|v| u32::try_from(v).map_err(|_| QueryError::Config(format!("{} is out of range: {}", name, v))))
        .transpose()
}

fn default_read_only() -> bool {
    true
}

fn default_locale() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Identifies the target database in cache keys; never logged
    #[serde(alias = "connectionString")]
    pub connection_identity: String,
    pub question: String,
    pub schema: Schema,
    #[serde(alias = "dbType")]
    pub dialect: Dialect,
    #[serde(default = "default_read_only", alias = "readOnlyMode")]
    pub read_only: bool,
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Keep row data out of the summary prompt
    #[serde(default)]
    pub privacy: bool,
    /// Hide real identifiers from the generator and repairer
    #[serde(default)]
    pub anonymize: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PolicyViolation,
    Generation,
    Execution,
    Database,
    Cancelled,
}

impl ErrorKind {
    fn of(error: &QueryError) -> Self {
        match error {
            QueryError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            QueryError::Generation(_) | QueryError::Llm(_) => ErrorKind::Generation,
            QueryError::Execution(_) | QueryError::Sqlx(_) => ErrorKind::Execution,
            QueryError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Database,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
    pub summary: Option<String>,
    pub was_repaired: bool,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl QueryResponse {
    fn failure(error: &QueryError) -> Self {
        Self {
            success: false,
            sql: None,
            rows: Vec::new(),
            columns: Vec::new(),
            summary: None,
            was_repaired: false,
            cached: false,
            error: Some(error.to_string()),
            error_kind: Some(ErrorKind::of(error)),
        }
    }
}

/// Successful end state of the retry loop
struct Executed {
    sql: String,
    output: QueryOutput,
    was_repaired: bool,
    /// Present when the request was anonymized; reused for the summary
    map: Option<AnonymizationMap>,
}

pub struct QueryOrchestrator {
    config: PipelineConfig,
    generator: Arc<dyn SqlGenerator>,
    repairer: Arc<dyn SqlRepairer>,
    summarizer: Arc<dyn Summarizer>,
    cache: Option<Arc<QueryCache>>,
    history: Option<Arc<dyn HistorySink>>,
    classifier: ErrorClassifier,
}

impl QueryOrchestrator {
    pub fn new(
        config: PipelineConfig,
        generator: Arc<dyn SqlGenerator>,
        repairer: Arc<dyn SqlRepairer>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            config,
            generator,
            repairer,
            summarizer,
            cache: None,
            history: None,
            classifier: ErrorClassifier::new(),
        }
    }

    /// One client for generation, repair and summaries
    pub fn with_llm<L>(config: PipelineConfig, llm: Arc<L>) -> Self
    where
        L: SqlGenerator + SqlRepairer + Summarizer + 'static,
    {
        Self::new(config, llm.clone(), llm.clone(), llm)
    }

    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Answer one question. The adapter is connected here and disconnected
    /// again before returning, whatever the outcome.
    pub async fn run(
        &self,
        request: &QueryRequest,
        adapter: &mut dyn DatabaseAdapter,
        cancel: &CancellationToken,
    ) -> QueryResponse {
        let policy = Policy::from_read_only(request.read_only);
        let fingerprint = request.schema.fingerprint();

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&request.connection_identity, &request.question, &fingerprint, policy) {
                info!("Answered from cache");
                return QueryResponse {
                    success: true,
                    sql: Some(hit.result.sql),
                    rows: hit.result.rows,
                    columns: hit.result.columns,
                    summary: hit.result.summary,
                    was_repaired: false,
                    cached: true,
                    error: None,
                    error_kind: None,
                };
            }
        }

        let started = Instant::now();
        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            result = self.connect_and_execute(request, adapter, policy) => result,
        };

        if let Err(e) = adapter.disconnect().await {
            warn!("Failed to release database session: {}", e);
        }

        let executed = match executed {
            Ok(executed) => executed,
            Err(e) => {
                warn!("Query failed ({:?}): {}", ErrorKind::of(&e), e);
                return QueryResponse::failure(&e);
            }
        };
        let elapsed = started.elapsed();

        let summary = tokio::select! {
            biased;
            _ = cancel.cancelled() => return QueryResponse::failure(&QueryError::Cancelled),
            summary = self.summarize(request, &executed) => summary,
        };

        let row_count = executed.output.rows.len();
        if let Some(cache) = &self.cache {
            cache.set(
                &request.connection_identity,
                &request.question,
                &fingerprint,
                policy,
                CachedResult {
                    sql: executed.sql.clone(),
                    rows: executed.output.rows.clone(),
                    columns: executed.output.columns.clone(),
                    summary: summary.clone(),
                },
            );
        }
        if let Some(history) = &self.history {
            if let Err(e) = history.record(&request.question, &executed.sql, row_count, elapsed) {
                warn!("Failed to record query history: {}", e);
            }
        }

        info!("Query returned {} rows in {} ms", row_count, elapsed.as_millis());
        QueryResponse {
            success: true,
            sql: Some(executed.sql),
            rows: executed.output.rows,
            columns: executed.output.columns,
            summary,
            was_repaired: executed.was_repaired,
            cached: false,
            error: None,
            error_kind: None,
        }
    }

    async fn connect_and_execute(
        &self,
        request: &QueryRequest,
        adapter: &mut dyn DatabaseAdapter,
        policy: Policy,
    ) -> Result<Executed> {
        adapter.connect().await?;
        self.execute_with_retry(request, &*adapter, policy).await
    }

    async fn execute_with_retry(
        &self,
        request: &QueryRequest,
        adapter: &dyn DatabaseAdapter,
        policy: Policy,
    ) -> Result<Executed> {
        let (schema, map): (Cow<'_, Schema>, Option<AnonymizationMap>) = if request.anonymize {
            let (schema, map) = anonymize(&request.schema);
            (Cow::Owned(schema), Some(map))
        } else {
            (Cow::Borrowed(&request.schema), None)
        };
        let guards = &self.config.guards;
        let max_executions = self.config.max_executions();

        // Last statement that reached the database, with its error
        let mut failed: Option<(String, String)> = None;
        let mut generation_error: Option<QueryError> = None;
        let mut was_repaired = false;

        for attempt in 1..=max_executions {
            info!("Execution attempt {} of {}", attempt, max_executions);

            // Nothing to repair until a statement has failed in the database
            let from_generator = failed.is_none();
            let produced = match &failed {
                None => {
                    debug!("Generating SQL");
                    self.generator
                        .generate_sql(&request.question, &schema, request.dialect, policy)
                        .await
                }
                Some((failed_sql, error)) => {
                    debug!("Repairing SQL");
                    was_repaired = true;
                    let (failed_sql, error) = match &map {
                        Some(map) => (Cow::Owned(map.anonymize_text(failed_sql)), Cow::Owned(map.anonymize_text(error))),
                        None => (Cow::Borrowed(failed_sql.as_str()), Cow::Borrowed(error.as_str())),
                    };
                    self.repairer
                        .fix_sql(&request.question, &failed_sql, &error, &schema, request.dialect)
                        .await
                }
            };

            let sql = match produced.map(|raw| strip_code_fences(&raw)) {
                Ok(sql) if !sql.is_empty() => sql,
                Ok(_) => {
                    warn!("Attempt {}: LLM returned no SQL", attempt);
                    generation_error = Some(QueryError::Generation("LLM returned an empty response".to_string()));
                    continue;
                }
                Err(e) => {
                    warn!("Attempt {}: SQL generation failed: {}", attempt, e);
                    generation_error = Some(match e {
                        QueryError::Generation(msg) => QueryError::Generation(msg),
                        other => QueryError::Generation(other.to_string()),
                    });
                    continue;
                }
            };

            let sql = match &map {
                Some(map) => map.deanonymize(&sql),
                None => sql,
            };

            let decision = validate_sql(&sql, policy);
            if !decision.valid {
                let reason = decision.reason.unwrap_or_else(|| "SQL rejected by policy".to_string());
                if from_generator {
                    warn!("Generated SQL rejected by {} policy", policy);
                    return Err(QueryError::PolicyViolation(reason));
                }
                warn!("Attempt {}: repaired SQL rejected by {} policy, discarding it", attempt, policy);
                continue;
            }

            let sql = guards.apply_limit(&sql);
            if map.is_none() {
                debug!("Executing: {}", sql);
            }

            match adapter.execute_query(&sql, guards.statement_timeout, guards.row_cap).await {
                Ok(output) => {
                    info!("Execution succeeded on attempt {}", attempt);
                    return Ok(Executed {
                        sql,
                        output,
                        was_repaired,
                        map,
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        "Attempt {}: execution failed ({})",
                        attempt,
                        self.classifier.classify(&message)
                    );
                    failed = Some((sql, message));
                }
            }
        }

        match (failed, generation_error) {
            (Some((_, error)), _) => Err(QueryError::Execution(error)),
            (None, Some(e)) => Err(e),
            (None, None) => Err(QueryError::Generation("No SQL attempts were made".to_string())),
        }
    }

    async fn summarize(&self, request: &QueryRequest, executed: &Executed) -> Option<String> {
        let rows = &executed.output.rows;

        // The summarizer is the same external model: under anonymization it
        // sees placeholder names only, and its answer is mapped back.
        let (sql, columns, sample): (Cow<'_, str>, Cow<'_, [String]>, Cow<'_, [Row]>) = match &executed.map {
            Some(map) => {
                let columns = map.anonymize_columns(&executed.sql, &executed.output.columns);
                let sample: Vec<Row> = if request.privacy {
                    Vec::new()
                } else {
                    let renamed: HashMap<&str, &str> = executed
                        .output
                        .columns
                        .iter()
                        .map(String::as_str)
                        .zip(columns.iter().map(String::as_str))
                        .collect();
                    rows.iter()
                        .map(|row| {
                            row.iter()
                                .map(|(k, v)| (renamed.get(k.as_str()).copied().unwrap_or(k.as_str()).to_string(), v.clone()))
                                .collect::<Row>()
                        })
                        .collect()
                };
                (Cow::Owned(map.anonymize_text(&executed.sql)), Cow::Owned(columns), Cow::Owned(sample))
            }
            None => {
                let sample: &[Row] = if request.privacy { &[] } else { rows };
                (
                    Cow::Borrowed(executed.sql.as_str()),
                    Cow::Borrowed(executed.output.columns.as_slice()),
                    Cow::Borrowed(sample),
                )
            }
        };

        match self
            .summarizer
            .generate_summary(&request.question, &sql, &sample, &columns, rows.len(), &request.locale)
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => Some(match &executed.map {
                Some(map) => map.deanonymize(&summary),
                None => summary,
            }),
            Ok(_) => None,
            Err(e) => {
                warn!("Summary generation failed: {}", e);
                None
            }
        }
    }
}
