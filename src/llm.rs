//! LLM collaborators
//!
//! The query pipeline talks to the language model through three narrow
//! traits. [`LlmClient`] implements all of them against an OpenAI-compatible
//! chat completions endpoint; tests substitute their own implementations.

use crate::db::{Dialect, Row};
use crate::error::{QueryError, Result};
use crate::execution_loop::error_classifier::extract_invalid_column;
use crate::schema::Schema;
use crate::security::Policy;
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_FAST_MODEL: &str = "gpt-4o-mini";

/// Rows shown to the summarizer
const SUMMARY_SAMPLE_ROWS: usize = 5;

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(&self, question: &str, schema: &Schema, dialect: Dialect, policy: Policy) -> Result<String>;
}

#[async_trait]
pub trait SqlRepairer: Send + Sync {
    async fn fix_sql(
        &self,
        question: &str,
        failed_sql: &str,
        error: &str,
        schema: &Schema,
        dialect: Dialect,
    ) -> Result<String>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `rows` may be a sample (or empty) while `row_count` is the full count.
    async fn generate_summary(
        &self,
        question: &str,
        sql: &str,
        rows: &[Row],
        columns: &[String],
        row_count: usize,
        locale: &str,
    ) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    /// Model used for SQL generation and repair
    pub model: String,
    /// Model used for summaries
    pub fast_model: String,
}

impl LlmConfig {
    /// Read `LLM_API_KEY`/`OPENAI_API_KEY`, `LLM_BASE_URL`, `LLM_MODEL` and
    /// `LLM_MODEL_FAST`. A custom base URL (a local server) may run without a key.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
        let base_url = std::env::var("LLM_BASE_URL").ok().filter(|u| !u.trim().is_empty());

        let api_key = match (api_key, &base_url) {
            (Some(key), _) => key,
            (None, Some(_)) => "not-needed".to_string(),
            (None, None) => {
                return Err(QueryError::Config(
                    "LLM_API_KEY or OPENAI_API_KEY must be set (or LLM_BASE_URL for a local model)".to_string(),
                ))
            }
        };

        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let fast_model = std::env::var("LLM_MODEL_FAST")
            .or_else(|_| std::env::var("LLM_MODEL"))
            .unwrap_or_else(|_| DEFAULT_FAST_MODEL.to_string());

        Ok(Self {
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model,
            fast_model,
        })
    }

    pub fn is_local(&self) -> bool {
        self.base_url != DEFAULT_BASE_URL
    }
}

pub struct LlmClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    async fn chat(&self, model: &str, system: &str, user: &str, temperature: f64, max_tokens: u32) -> Result<String> {
        let body = serde_json::json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| QueryError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(QueryError::Llm(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| QueryError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(finish_reason) = response_json["choices"][0]["finish_reason"].as_str() {
            if finish_reason == "length" {
                warn!("LLM response was truncated due to length limit");
            }
        }

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| QueryError::Llm("No content in LLM response".to_string()))?;

        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl SqlGenerator for LlmClient {
    async fn generate_sql(&self, question: &str, schema: &Schema, dialect: Dialect, policy: Policy) -> Result<String> {
        let system = generation_prompt(schema, dialect, policy);
        let user = format!(
            "Question: {}\n\nGenerate SQL using ONLY columns from the schema. If unsure, use SELECT * or COUNT(*).",
            question
        );

        let raw = self.chat(&self.config.model, &system, &user, 0.0, 1000).await?;
        non_empty_sql(strip_code_fences(&raw))
    }
}

#[async_trait]
impl SqlRepairer for LlmClient {
    async fn fix_sql(
        &self,
        question: &str,
        failed_sql: &str,
        error: &str,
        schema: &Schema,
        dialect: Dialect,
    ) -> Result<String> {
        let system = repair_prompt(failed_sql, error, schema, dialect);
        let user = format!(
            "Original question: \"{}\"\n\nFailed SQL:\n{}\n\nError: {}\n\nFix it using ONLY columns that exist in the schema above.",
            question, failed_sql, error
        );

        let raw = self.chat(&self.config.model, &system, &user, 0.0, 1000).await?;
        non_empty_sql(strip_code_fences(&raw))
    }
}

#[async_trait]
impl Summarizer for LlmClient {
    async fn generate_summary(
        &self,
        question: &str,
        _sql: &str,
        rows: &[Row],
        columns: &[String],
        row_count: usize,
        locale: &str,
    ) -> Result<String> {
        let (system, user) = summary_prompt(question, rows, columns, row_count, locale);
        let summary = self.chat(&self.config.fast_model, &system, &user, 0.3, 200).await?;

        if summary.is_empty() {
            return Ok(fallback_summary(row_count, locale));
        }
        Ok(summary)
    }
}

fn non_empty_sql(sql: String) -> Result<String> {
    if sql.is_empty() {
        return Err(QueryError::Generation("LLM returned an empty response".to_string()));
    }
    Ok(sql)
}

/// Remove a surrounding markdown code fence, with or without a `sql` tag.
pub fn strip_code_fences(text: &str) -> String {
    let mut clean = text.trim();
    if let Some(rest) = clean.strip_prefix("```sql") {
        clean = rest;
    } else if let Some(rest) = clean.strip_prefix("```") {
        clean = rest;
    }
    if let Some(rest) = clean.strip_suffix("```") {
        clean = rest;
    }
    clean.trim().to_string()
}

pub fn fallback_summary(row_count: usize, locale: &str) -> String {
    if locale == "ru" {
        format!("Найдено {} записей.", row_count)
    } else {
        format!("Found {} records.", row_count)
    }
}

fn dialect_tips(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::MySql => "MySQL: backticks for identifiers, IFNULL(), DATE_SUB(NOW(), INTERVAL 1 MONTH)",
        Dialect::Postgres => "PostgreSQL: ILIKE for case-insensitive, COALESCE(), NOW() - INTERVAL '1 month'",
    }
}

/// One `table: col, col` line per table.
pub fn compact_schema(schema: &Schema) -> String {
    schema
        .tables
        .iter()
        .map(|t| {
            let cols: Vec<&str> = t.columns.iter().map(|c| c.name.as_str()).collect();
            format!("{}: {}", t.name, cols.join(", "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn detailed_schema(schema: &Schema) -> String {
    let mut parts = Vec::new();

    for table in &schema.tables {
        let mut lines = vec![format!("TABLE: {}", table.name), "  COLUMNS (ONLY THESE EXIST):".to_string()];
        for col in &table.columns {
            let marker = if col.is_primary_key { " [PK]" } else { "" };
            lines.push(format!("    - {}: {}{}", col.name, col.data_type, marker));
        }

        if let Some(fks) = table.foreign_keys.as_ref().filter(|fks| !fks.is_empty()) {
            lines.push("  FOREIGN KEYS:".to_string());
            for fk in fks {
                lines.push(format!("    - {} -> {}.{}", fk.column, fk.references_table, fk.references_column));
            }
        }

        parts.push(lines.join("\n"));
    }

    parts.join("\n\n")
}

/// Relationships implied by `<name>_id` columns, e.g. `orders.user_id -> users.id`.
pub fn inferred_relationships(schema: &Schema) -> Vec<String> {
    let table_names: HashSet<String> = schema.tables.iter().map(|t| t.name.to_lowercase()).collect();
    let mut hints = Vec::new();

    for table in &schema.tables {
        for col in &table.columns {
            let lower = col.name.to_lowercase();
            let Some(stem) = lower.strip_suffix("_id") else {
                continue;
            };
            if stem.is_empty() {
                continue;
            }

            let plural = format!("{}s", stem);
            if table_names.contains(stem) {
                hints.push(format!("{}.{} -> {}.id", table.name, col.name, stem));
            } else if table_names.contains(&plural) {
                hints.push(format!("{}.{} -> {}.id", table.name, col.name, plural));
            }
        }
    }

    hints
}

pub fn generation_prompt(schema: &Schema, dialect: Dialect, policy: Policy) -> String {
    let relationships = inferred_relationships(schema);
    let relationships = if relationships.is_empty() {
        String::new()
    } else {
        format!("\nRELATIONSHIPS:\n{}", relationships.join("\n"))
    };

    format!(
        r#"You are a {dialect} SQL generator. Convert questions to SQL.

CRITICAL RULES:
1. Use ONLY columns from the schema below. Never invent columns.
2. When unsure which column to use, fall back to COUNT(*) or SELECT *.
3. Check every column name against the schema before using it.
4. {rule}
5. Add LIMIT 100 to non-aggregate SELECT queries.
6. Return ONLY raw SQL. No markdown, no backticks, no explanation.

{tips}

=== VALID TABLES AND COLUMNS (USE ONLY THESE) ===
{compact}

=== DETAILED SCHEMA ===
{detailed}
{relationships}

If a column is not listed above, do not use it."#,
        dialect = dialect.as_str().to_uppercase(),
        rule = policy.prompt_rule(),
        tips = dialect_tips(dialect),
        compact = compact_schema(schema),
        detailed = detailed_schema(schema),
        relationships = relationships,
    )
}

/// Schema column names closest to `invalid`, best first.
pub fn column_suggestions(schema: &Schema, invalid: &str, limit: usize) -> Vec<String> {
    let invalid = invalid.rsplit('.').next().unwrap_or(invalid).to_lowercase();
    let mut scored: Vec<(f64, String)> = schema
        .tables
        .iter()
        .flat_map(|t| t.columns.iter().map(move |c| (t, c)))
        .map(|(t, c)| {
            let score = strsim::jaro_winkler(&invalid, &c.name.to_lowercase());
            (score, format!("{}.{}", t.name, c.name))
        })
        .filter(|(score, _)| *score >= 0.8)
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(limit).map(|(_, name)| name).collect()
}

pub fn repair_prompt(failed_sql: &str, error: &str, schema: &Schema, dialect: Dialect) -> String {
    let failed_lower = failed_sql.to_lowercase();
    let guidance: Vec<String> = schema
        .tables
        .iter()
        .filter(|t| failed_lower.contains(&t.name.to_lowercase()))
        .map(|t| {
            let cols: Vec<&str> = t.columns.iter().map(|c| c.name.as_str()).collect();
            format!("{} has ONLY these columns: {}", t.name, cols.join(", "))
        })
        .collect();

    let mut prompt = format!(
        "Fix this {} SQL error.\n\nVALID TABLES AND COLUMNS:\n{}\n",
        dialect.as_str().to_uppercase(),
        compact_schema(schema)
    );

    if !guidance.is_empty() {
        prompt.push_str(&format!("\nVALID COLUMNS FOR TABLES IN YOUR QUERY:\n{}\n", guidance.join("\n")));
    }

    prompt.push_str(
        "\nRULES:\n\
         1. Remove or replace anything the error points at with something that EXISTS in the schema\n\
         2. If no matching column exists, use COUNT(*) or SELECT *\n\
         3. Return ONLY the fixed SQL, no explanations\n",
    );

    if let Some(invalid) = extract_invalid_column(error) {
        debug!("Repair prompt targets invalid column");
        prompt.push_str(&format!("4. The column \"{}\" does NOT exist, do not use it\n", invalid));
        let suggestions = column_suggestions(schema, &invalid, 3);
        if !suggestions.is_empty() {
            prompt.push_str(&format!("Closest existing columns: {}\n", suggestions.join(", ")));
        }
    }

    prompt
}

fn format_value(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => "null".to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// System and user prompts for the result summary.
pub fn summary_prompt(
    question: &str,
    rows: &[Row],
    columns: &[String],
    row_count: usize,
    locale: &str,
) -> (String, String) {
    let sample = rows
        .iter()
        .take(SUMMARY_SAMPLE_ROWS)
        .map(|row| {
            columns
                .iter()
                .map(|col| format!("{}: {}", col, format_value(row.get(col))))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect::<Vec<_>>()
        .join("\n");

    if locale == "ru" {
        let system = "Ты аналитик данных. Кратко опиши результаты запроса на русском.\n\n\
                      Правила:\n\
                      - Максимум 1-2 предложения\n\
                      - Только факты: количество записей и ключевые данные\n\
                      - Без вводных фраз и без предложений помощи"
            .to_string();
        let data = if sample.is_empty() {
            if row_count > 0 { "Данные скрыты.".to_string() } else { "Данных нет.".to_string() }
        } else {
            format!("Данные:\n{}", sample)
        };
        let user = format!(
            "Вопрос: \"{}\"\nНайдено строк: {}\nКолонки: {}\n{}",
            question,
            row_count,
            columns.join(", "),
            data
        );
        (system, user)
    } else {
        let system = "You are a data analyst. Briefly describe the query results in English.\n\n\
                      Rules:\n\
                      - Maximum 1-2 sentences\n\
                      - Only facts: number of records and key data\n\
                      - No introductory phrases and no offers of help"
            .to_string();
        let data = if sample.is_empty() {
            if row_count > 0 { "Data withheld.".to_string() } else { "No data.".to_string() }
        } else {
            format!("Data:\n{}", sample)
        };
        let user = format!(
            "Question: \"{}\"\nRows found: {}\nColumns: {}\n{}",
            question,
            row_count,
            columns.join(", "),
            data
        );
        (system, user)
    }
}
