//! End-to-end tests of the query pipeline with scripted collaborators.

use async_trait::async_trait;
use humanql::cache::{CacheConfig, QueryCache};
use humanql::db::{DatabaseAdapter, Dialect, QueryOutput, Row};
use humanql::execution_loop::ErrorKind;
use humanql::history::{HistorySink, HistoryStore};
use humanql::llm::{SqlGenerator, SqlRepairer, Summarizer};
use humanql::schema::Schema;
use humanql::security::Policy;
use humanql::{PipelineConfig, QueryError, QueryOrchestrator, QueryRequest, Result};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Returns scripted answers in order, repeating the last one.
struct Script {
    answers: Mutex<VecDeque<Result<String>>>,
    last: Mutex<Option<String>>,
    calls: Mutex<Vec<(String, String)>>,
    schemas: Mutex<Vec<Schema>>,
}

impl Script {
    fn new(answers: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            last: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            schemas: Mutex::new(Vec::new()),
        })
    }

    fn always(sql: &str) -> Arc<Self> {
        Self::new(vec![Ok(sql.to_string())])
    }

    fn next(&self) -> Result<String> {
        match self.answers.lock().unwrap().pop_front() {
            Some(Ok(sql)) => {
                *self.last.lock().unwrap() = Some(sql.clone());
                Ok(sql)
            }
            Some(Err(e)) => Err(e),
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| QueryError::Llm("script exhausted".to_string())),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SqlGenerator for Script {
    async fn generate_sql(&self, question: &str, schema: &Schema, _dialect: Dialect, _policy: Policy) -> Result<String> {
        self.calls.lock().unwrap().push((question.to_string(), String::new()));
        self.schemas.lock().unwrap().push(schema.clone());
        self.next()
    }
}

#[async_trait]
impl SqlRepairer for Script {
    async fn fix_sql(
        &self,
        _question: &str,
        failed_sql: &str,
        error: &str,
        schema: &Schema,
        _dialect: Dialect,
    ) -> Result<String> {
        self.calls.lock().unwrap().push((failed_sql.to_string(), error.to_string()));
        self.schemas.lock().unwrap().push(schema.clone());
        self.next()
    }
}

#[derive(Default)]
struct StubSummarizer {
    fail: bool,
    /// Answer with the column names it was given
    mention_columns: bool,
    seen: Mutex<Vec<(usize, usize)>>,
    /// (sql, columns, row keys) of every call
    prompts: Mutex<Vec<(String, Vec<String>, Vec<String>)>>,
}

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn generate_summary(
        &self,
        _question: &str,
        sql: &str,
        rows: &[Row],
        columns: &[String],
        row_count: usize,
        _locale: &str,
    ) -> Result<String> {
        self.seen.lock().unwrap().push((rows.len(), row_count));
        let row_keys = rows.iter().flat_map(|r| r.keys().cloned()).collect();
        self.prompts
            .lock()
            .unwrap()
            .push((sql.to_string(), columns.to_vec(), row_keys));
        if self.fail {
            return Err(QueryError::Llm("summary service down".to_string()));
        }
        if self.mention_columns {
            return Ok(format!("Found {} records of {}.", row_count, columns.join(", ")));
        }
        Ok(format!("Found {} records.", row_count))
    }
}

#[derive(Default)]
struct AdapterLog {
    connects: usize,
    disconnects: usize,
    executed: Vec<String>,
}

/// Database stub: each execution pops the next scripted outcome; the last one repeats.
struct StubAdapter {
    log: Arc<Mutex<AdapterLog>>,
    outcomes: Mutex<VecDeque<std::result::Result<Vec<Row>, String>>>,
    delay: Option<Duration>,
}

impl StubAdapter {
    fn new(outcomes: Vec<std::result::Result<Vec<Row>, String>>) -> (Self, Arc<Mutex<AdapterLog>>) {
        let log = Arc::new(Mutex::new(AdapterLog::default()));
        let adapter = Self {
            log: log.clone(),
            outcomes: Mutex::new(outcomes.into()),
            delay: None,
        };
        (adapter, log)
    }
}

#[async_trait]
impl DatabaseAdapter for StubAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn connect(&mut self) -> Result<()> {
        self.log.lock().unwrap().connects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.log.lock().unwrap().disconnects += 1;
        Ok(())
    }

    async fn get_schema(&self) -> Result<Schema> {
        Ok(Schema::demo())
    }

    async fn execute_query(&self, sql: &str, _timeout: Duration, max_rows: usize) -> Result<QueryOutput> {
        self.log.lock().unwrap().executed.push(sql.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                outcomes.pop_front()
            } else {
                outcomes.front().cloned()
            }
        };

        match outcome {
            Some(Ok(mut rows)) => {
                rows.truncate(max_rows);
                let columns = rows
                    .first()
                    .map(|r| r.keys().cloned().collect())
                    .unwrap_or_default();
                Ok(QueryOutput { rows, columns })
            }
            Some(Err(message)) => Err(QueryError::Execution(message)),
            None => Ok(QueryOutput::default()),
        }
    }

    async fn check_write_access(&self) -> Result<bool> {
        Ok(false)
    }
}

fn rows(n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| json!({"id": i, "email": format!("user{}@example.com", i)}).as_object().cloned().unwrap())
        .collect()
}

fn request(question: &str) -> QueryRequest {
    QueryRequest {
        connection_identity: "postgres://demo".to_string(),
        question: question.to_string(),
        schema: Schema::demo(),
        dialect: Dialect::Postgres,
        read_only: true,
        locale: "en".to_string(),
        privacy: false,
        anonymize: false,
    }
}

struct Harness {
    orchestrator: QueryOrchestrator,
    generator: Arc<Script>,
    repairer: Arc<Script>,
    summarizer: Arc<StubSummarizer>,
    cache: Arc<QueryCache>,
    history: Arc<HistoryStore>,
}

fn harness(generator: Arc<Script>, repairer: Arc<Script>, summarizer: StubSummarizer) -> Harness {
    let summarizer = Arc::new(summarizer);
    let cache = Arc::new(QueryCache::new(CacheConfig::default()));
    let history = Arc::new(HistoryStore::in_memory().unwrap());
    let orchestrator = QueryOrchestrator::new(
        PipelineConfig::default(),
        generator.clone(),
        repairer.clone(),
        summarizer.clone(),
    )
    .with_cache(cache.clone())
    .with_history(history.clone() as Arc<dyn HistorySink>);

    Harness {
        orchestrator,
        generator,
        repairer,
        summarizer,
        cache,
        history,
    }
}

#[tokio::test]
async fn test_first_attempt_success() {
    let h = harness(
        Script::always("```sql\nSELECT id, email FROM users;\n```"),
        Script::new(vec![]),
        StubSummarizer::default(),
    );
    let (mut adapter, log) = StubAdapter::new(vec![Ok(rows(3))]);

    let response = h.orchestrator.run(&request("list users"), &mut adapter, &CancellationToken::new()).await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.sql.as_deref(), Some("SELECT id, email FROM users LIMIT 100"));
    assert_eq!(response.rows.len(), 3);
    assert_eq!(response.summary.as_deref(), Some("Found 3 records."));
    assert!(!response.was_repaired);
    assert!(!response.cached);

    let log = log.lock().unwrap();
    assert_eq!(log.connects, 1);
    assert_eq!(log.disconnects, 1);
    assert_eq!(log.executed, vec!["SELECT id, email FROM users LIMIT 100"]);
    assert_eq!(h.cache.len(), 1);
    assert_eq!(h.history.history().unwrap().len(), 1);
    assert_eq!(h.repairer.call_count(), 0);
}

#[tokio::test]
async fn test_retry_terminates_after_max_repairs() {
    let h = harness(
        Script::always("SELECT nope FROM users"),
        Script::always("SELECT still_nope FROM users"),
        StubSummarizer::default(),
    );
    let (mut adapter, log) = StubAdapter::new(vec![
        Err("column \"nope\" does not exist".to_string()),
        Err("column \"still_nope\" does not exist".to_string()),
        Err("column \"still_nope_again\" does not exist".to_string()),
    ]);

    let response = h.orchestrator.run(&request("broken"), &mut adapter, &CancellationToken::new()).await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::Execution));
    assert_eq!(response.error.as_deref(), Some("column \"still_nope_again\" does not exist"));

    let log = log.lock().unwrap();
    assert_eq!(log.executed.len() as u32, 1 + PipelineConfig::default().max_repairs);
    assert_eq!(log.disconnects, 1);
    assert_eq!(h.repairer.call_count(), 2);
    assert!(h.cache.is_empty());
    assert!(h.history.history().unwrap().is_empty());
}

#[tokio::test]
async fn test_repair_after_execution_error() {
    let h = harness(
        Script::always("SELECT emial FROM users"),
        Script::always("SELECT email FROM users"),
        StubSummarizer::default(),
    );
    let (mut adapter, _log) = StubAdapter::new(vec![Err("column \"emial\" does not exist".to_string()), Ok(rows(2))]);

    let response = h.orchestrator.run(&request("emails"), &mut adapter, &CancellationToken::new()).await;

    assert!(response.success);
    assert!(response.was_repaired);
    assert_eq!(response.sql.as_deref(), Some("SELECT email FROM users LIMIT 100"));

    let calls = h.repairer.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "SELECT emial FROM users LIMIT 100");
    assert_eq!(calls[0].1, "column \"emial\" does not exist");
}

#[tokio::test]
async fn test_repair_violating_policy_is_never_executed() {
    let h = harness(
        Script::always("SELECT emial FROM users"),
        Script::always("DROP TABLE users"),
        StubSummarizer::default(),
    );
    let (mut adapter, log) = StubAdapter::new(vec![Err("column \"emial\" does not exist".to_string())]);

    let response = h.orchestrator.run(&request("emails"), &mut adapter, &CancellationToken::new()).await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::Execution));
    assert_eq!(response.error.as_deref(), Some("column \"emial\" does not exist"));

    let log = log.lock().unwrap();
    assert_eq!(log.executed.len(), 1);
    assert!(log.executed.iter().all(|sql| !sql.contains("DROP")));
    assert_eq!(h.repairer.call_count(), 2);
    // The rejected repair never replaces the failed statement
    let calls = h.repairer.calls.lock().unwrap();
    assert_eq!(calls[1].0, "SELECT emial FROM users LIMIT 100");
}

#[tokio::test]
async fn test_rejected_repair_then_valid_repair() {
    let h = harness(
        Script::always("SELECT emial FROM users"),
        Script::new(vec![Ok("DELETE FROM users".to_string()), Ok("SELECT email FROM users".to_string())]),
        StubSummarizer::default(),
    );
    let (mut adapter, log) = StubAdapter::new(vec![Err("column \"emial\" does not exist".to_string()), Ok(rows(1))]);

    let response = h.orchestrator.run(&request("emails"), &mut adapter, &CancellationToken::new()).await;

    assert!(response.success);
    assert!(response.was_repaired);
    assert_eq!(log.lock().unwrap().executed.len(), 2);
}

#[tokio::test]
async fn test_generated_policy_violation_is_terminal() {
    let h = harness(
        Script::always("DELETE FROM users WHERE id = 1"),
        Script::new(vec![]),
        StubSummarizer::default(),
    );
    let (mut adapter, log) = StubAdapter::new(vec![Ok(rows(1))]);

    let response = h.orchestrator.run(&request("remove user 1"), &mut adapter, &CancellationToken::new()).await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::PolicyViolation));
    assert_eq!(response.error.as_deref(), Some("SQL contains forbidden keyword: DELETE."));
    assert_eq!(h.generator.call_count(), 1);
    assert_eq!(h.repairer.call_count(), 0);

    let log = log.lock().unwrap();
    assert!(log.executed.is_empty());
    assert_eq!(log.disconnects, 1);
}

#[tokio::test]
async fn test_limited_write_dml_gets_limit_appended() {
    let h = harness(
        Script::always("UPDATE products SET stock = 0 WHERE id = 3"),
        Script::new(vec![]),
        StubSummarizer::default(),
    );
    let (mut adapter, log) = StubAdapter::new(vec![Ok(vec![])]);
    let mut req = request("sell out product 3");
    req.read_only = false;

    let response = h.orchestrator.run(&req, &mut adapter, &CancellationToken::new()).await;

    assert!(response.success);
    // Known limitation: the limit is appended to DML too. PostgreSQL rejects
    // `UPDATE ... LIMIT`; that error goes through the repair loop like any other.
    assert_eq!(log.lock().unwrap().executed, vec!["UPDATE products SET stock = 0 WHERE id = 3 LIMIT 100"]);
    assert!(response.columns.is_empty());
}

#[tokio::test]
async fn test_generation_failure_consumes_an_attempt() {
    let h = harness(
        Script::new(vec![
            Err(QueryError::Llm("rate limited".to_string())),
            Ok("SELECT COUNT(*) AS n FROM orders".to_string()),
        ]),
        Script::new(vec![]),
        StubSummarizer::default(),
    );
    let (mut adapter, log) = StubAdapter::new(vec![Ok(vec![json!({"n": 7}).as_object().cloned().unwrap()])]);

    let response = h.orchestrator.run(&request("how many orders"), &mut adapter, &CancellationToken::new()).await;

    assert!(response.success);
    assert_eq!(h.generator.call_count(), 2);
    assert_eq!(log.lock().unwrap().executed.len(), 1);
}

#[tokio::test]
async fn test_generation_failure_without_budget_is_terminal() {
    let h = harness(
        Script::new(vec![Ok(String::new())]),
        Script::new(vec![]),
        StubSummarizer::default(),
    );
    let (mut adapter, log) = StubAdapter::new(vec![Ok(rows(1))]);

    let response = h.orchestrator.run(&request("anything"), &mut adapter, &CancellationToken::new()).await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::Generation));
    assert_eq!(h.generator.call_count(), 3);
    assert!(log.lock().unwrap().executed.is_empty());
}

#[tokio::test]
async fn test_second_identical_question_is_served_from_cache() {
    let h = harness(
        Script::always("SELECT * FROM products"),
        Script::new(vec![]),
        StubSummarizer::default(),
    );
    let (mut adapter, log) = StubAdapter::new(vec![Ok(rows(2))]);
    let req = request("all products");

    let first = h.orchestrator.run(&req, &mut adapter, &CancellationToken::new()).await;
    let second = h.orchestrator.run(&req, &mut adapter, &CancellationToken::new()).await;

    assert!(first.success && second.success);
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.rows, first.rows);
    assert_eq!(second.summary, first.summary);
    assert_eq!(h.generator.call_count(), 1);
    assert_eq!(log.lock().unwrap().connects, 1);
    assert_eq!(h.history.history().unwrap().len(), 1);
}

#[tokio::test]
async fn test_schema_change_misses_cache() {
    let h = harness(
        Script::always("SELECT * FROM products"),
        Script::new(vec![]),
        StubSummarizer::default(),
    );
    let (mut adapter, _log) = StubAdapter::new(vec![Ok(rows(2))]);
    let req = request("all products");
    let mut changed = req.clone();
    changed.schema.tables.pop();

    h.orchestrator.run(&req, &mut adapter, &CancellationToken::new()).await;
    let response = h.orchestrator.run(&changed, &mut adapter, &CancellationToken::new()).await;

    assert!(!response.cached);
    assert_eq!(h.generator.call_count(), 2);
}

#[tokio::test]
async fn test_anonymized_flow_hides_real_names() {
    let h = harness(
        Script::always("SELECT t.col_2 FROM table_1 t WHERE t.col_5 = true"),
        Script::always("SELECT col_2 FROM table_1"),
        StubSummarizer::default(),
    );
    let (mut adapter, log) = StubAdapter::new(vec![
        Err("column t.is_active does not exist in users".to_string()),
        Ok(rows(1)),
    ]);
    let mut req = request("active user emails");
    req.anonymize = true;

    let response = h.orchestrator.run(&req, &mut adapter, &CancellationToken::new()).await;

    assert!(response.success);
    assert_eq!(
        log.lock().unwrap().executed,
        vec![
            "SELECT t.email FROM users t WHERE t.is_active = true LIMIT 100",
            "SELECT email FROM users LIMIT 100",
        ]
    );

    for schema in h.generator.schemas.lock().unwrap().iter().chain(h.repairer.schemas.lock().unwrap().iter()) {
        assert_eq!(schema.tables[0].name, "table_1");
        assert!(schema.tables.iter().all(|t| t.columns.iter().all(|c| c.name.starts_with("col_"))));
    }

    let calls = h.repairer.calls.lock().unwrap();
    assert_eq!(calls[0].0, "SELECT t.col_2 FROM table_1 t WHERE t.col_5 = true LIMIT 100");
    assert!(!calls[0].1.contains("users"));
}

#[tokio::test]
async fn test_anonymized_summary_sees_placeholders_only() {
    let h = harness(
        Script::always("SELECT t.col_2, t.col_5 FROM table_1 t"),
        Script::new(vec![]),
        StubSummarizer {
            mention_columns: true,
            ..Default::default()
        },
    );
    let row = json!({"email": "a@example.com", "is_active": true}).as_object().cloned().unwrap();
    let (mut adapter, _log) = StubAdapter::new(vec![Ok(vec![row])]);
    let mut req = request("active flags");
    req.anonymize = true;

    let response = h.orchestrator.run(&req, &mut adapter, &CancellationToken::new()).await;

    assert!(response.success);
    assert_eq!(response.sql.as_deref(), Some("SELECT t.email, t.is_active FROM users t LIMIT 100"));

    let prompts = h.summarizer.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    let (sql, columns, row_keys) = &prompts[0];
    assert_eq!(sql, "SELECT t.col_2, t.col_5 FROM table_1 t LIMIT 100");
    let mut columns = columns.clone();
    columns.sort();
    assert_eq!(columns, vec!["col_2", "col_5"]);
    let mut row_keys = row_keys.clone();
    row_keys.sort();
    assert_eq!(row_keys, vec!["col_2", "col_5"]);

    let real_names = ["users", "email", "is_active"];
    assert!(real_names.iter().all(|name| !sql.contains(name)));

    // The answer is mapped back to real names for the caller
    let summary = response.summary.unwrap();
    assert!(summary.contains("email"), "{}", summary);
    assert!(!summary.contains("col_"), "{}", summary);
}

#[tokio::test]
async fn test_anonymized_privacy_summary_gets_no_rows_or_names() {
    let h = harness(
        Script::always("SELECT col_2 FROM table_1"),
        Script::new(vec![]),
        StubSummarizer::default(),
    );
    let (mut adapter, _log) = StubAdapter::new(vec![Ok(rows(2))]);
    let mut req = request("emails");
    req.anonymize = true;
    req.privacy = true;

    let response = h.orchestrator.run(&req, &mut adapter, &CancellationToken::new()).await;

    assert!(response.success);
    let prompts = h.summarizer.prompts.lock().unwrap();
    let (sql, columns, row_keys) = &prompts[0];
    assert_eq!(sql, "SELECT col_2 FROM table_1 LIMIT 100");
    assert!(columns.iter().all(|c| c != "email" && c != "id"), "{:?}", columns);
    assert!(row_keys.is_empty());
    assert_eq!(*h.summarizer.seen.lock().unwrap(), vec![(0, 2)]);
}

#[tokio::test]
async fn test_summary_failure_does_not_fail_query() {
    let h = harness(
        Script::always("SELECT * FROM users"),
        Script::new(vec![]),
        StubSummarizer {
            fail: true,
            ..Default::default()
        },
    );
    let (mut adapter, _log) = StubAdapter::new(vec![Ok(rows(4))]);

    let response = h.orchestrator.run(&request("users"), &mut adapter, &CancellationToken::new()).await;

    assert!(response.success);
    assert_eq!(response.summary, None);
    assert_eq!(response.rows.len(), 4);
    assert_eq!(h.cache.len(), 1);
}

#[tokio::test]
async fn test_privacy_keeps_rows_from_summarizer() {
    let h = harness(
        Script::always("SELECT * FROM users"),
        Script::new(vec![]),
        StubSummarizer::default(),
    );
    let (mut adapter, _log) = StubAdapter::new(vec![Ok(rows(6))]);
    let mut req = request("users");
    req.privacy = true;

    let response = h.orchestrator.run(&req, &mut adapter, &CancellationToken::new()).await;

    assert!(response.success);
    assert_eq!(response.rows.len(), 6);
    assert_eq!(*h.summarizer.seen.lock().unwrap(), vec![(0, 6)]);
}

#[tokio::test]
async fn test_cancellation_releases_session() {
    let h = harness(
        Script::always("SELECT * FROM orders"),
        Script::new(vec![]),
        StubSummarizer::default(),
    );
    let (mut adapter, log) = StubAdapter::new(vec![Ok(rows(1))]);
    adapter.delay = Some(Duration::from_secs(30));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let response = h.orchestrator.run(&request("slow"), &mut adapter, &cancel).await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::Cancelled));
    let log = log.lock().unwrap();
    assert_eq!(log.connects, 1);
    assert_eq!(log.disconnects, 1);
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn test_row_cap_bounds_results() {
    let generator = Script::always("SELECT * FROM users LIMIT 100000");
    let summarizer = Arc::new(StubSummarizer::default());
    let mut config = PipelineConfig::default();
    config.guards.row_cap = 5;
    let orchestrator = QueryOrchestrator::new(config, generator.clone(), Script::new(vec![]), summarizer);
    let (mut adapter, log) = StubAdapter::new(vec![Ok(rows(50))]);

    let response = orchestrator.run(&request("everyone"), &mut adapter, &CancellationToken::new()).await;

    assert!(response.success);
    assert_eq!(response.rows.len(), 5);
    // Oversized limits are passed through unchanged
    assert_eq!(log.lock().unwrap().executed, vec!["SELECT * FROM users LIMIT 100000"]);
}
