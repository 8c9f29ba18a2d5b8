//! Query Guards
//!
//! Row and time limits applied to every statement before and during execution.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// Query guards configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryGuards {
    /// Value of the LIMIT clause appended to unbounded statements
    pub result_limit: u64,
    /// Hard cap on rows read back from the database, independent of any LIMIT
    pub row_cap: usize,
    pub statement_timeout: Duration,
}

impl Default for QueryGuards {
    fn default() -> Self {
        Self {
            result_limit: 100,
            row_cap: 10_000,
            statement_timeout: Duration::from_secs(10),
        }
    }
}

impl QueryGuards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_limit(&self, sql: &str) -> String {
        ensure_limit(sql, self.result_limit)
    }
}

fn limit_pattern() -> &'static Regex {
    static LIMIT: OnceLock<Regex> = OnceLock::new();
    LIMIT.get_or_init(|| Regex::new(r"(?i)\bLIMIT\b").expect("literal pattern"))
}

/// Append `LIMIT <max_rows>` unless the statement already has a LIMIT.
///
/// An existing limit is kept as written, even when it exceeds `max_rows`;
/// the executor's row cap is the backstop for oversized limits.
/// INSERT/UPDATE/DELETE get the clause as well.
pub fn ensure_limit(sql: &str, max_rows: u64) -> String {
    if limit_pattern().is_match(sql) {
        return sql.to_string();
    }

    let trimmed = sql.trim();
    let clean = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();

    format!("{} LIMIT {}", clean, max_rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_limit() {
        assert_eq!(ensure_limit("SELECT * FROM t", 100), "SELECT * FROM t LIMIT 100");
    }

    #[test]
    fn test_existing_limit_unchanged() {
        assert_eq!(ensure_limit("SELECT * FROM t LIMIT 5", 100), "SELECT * FROM t LIMIT 5");
        assert_eq!(ensure_limit("select * from t limit 5;", 100), "select * from t limit 5;");
    }

    #[test]
    fn test_oversized_limit_is_not_clamped() {
        let sql = "SELECT * FROM t LIMIT 100000";
        assert_eq!(ensure_limit(sql, 100), sql);
    }

    #[test]
    fn test_strips_single_trailing_semicolon() {
        assert_eq!(ensure_limit("  SELECT * FROM t;  ", 10), "SELECT * FROM t LIMIT 10");
    }

    #[test]
    fn test_limit_inside_identifier_is_not_a_limit() {
        assert_eq!(
            ensure_limit("SELECT rate_limit FROM plans", 50),
            "SELECT rate_limit FROM plans LIMIT 50"
        );
    }

    #[test]
    fn test_dml_is_not_exempt() {
        // Known limitation: statements are not classified before the limit goes on.
        assert_eq!(
            ensure_limit("DELETE FROM t WHERE id = 1;", 100),
            "DELETE FROM t WHERE id = 1 LIMIT 100"
        );
        assert_eq!(
            ensure_limit("INSERT INTO t (id) VALUES (1)", 100),
            "INSERT INTO t (id) VALUES (1) LIMIT 100"
        );
    }

    #[test]
    fn test_idempotent() {
        let once = ensure_limit("SELECT 1", 7);
        assert_eq!(ensure_limit(&once, 7), once);
    }

    #[test]
    fn test_guards_defaults() {
        let guards = QueryGuards::default();
        assert_eq!(guards.result_limit, 100);
        assert_eq!(guards.row_cap, 10_000);
        assert_eq!(guards.statement_timeout, Duration::from_secs(10));
        assert_eq!(guards.apply_limit("SELECT 1"), "SELECT 1 LIMIT 100");
    }
}
