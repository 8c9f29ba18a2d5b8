//! Security Policy Definitions
//!
//! Keyword-level classification of SQL text under a read/write policy.
//! The check is textual: keywords inside subqueries, CTEs and string
//! literals count the same as top-level ones.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

const FORBIDDEN_KEYWORDS_READONLY: &[&str] = &[
    "DROP", "DELETE", "UPDATE", "INSERT", "TRUNCATE", "ALTER", "CREATE", "GRANT", "REVOKE", "EXEC",
    "EXECUTE", "CALL",
];

/// Forbidden even when writes are allowed.
const ALWAYS_FORBIDDEN: &[&str] = &["DROP", "TRUNCATE", "ALTER", "CREATE", "GRANT", "REVOKE"];

const READONLY_LEADING_KEYWORDS: &[&str] = &["SELECT", "WITH"];

/// Permission mode governing which statements may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    ReadOnly,
    LimitedWrite,
}

impl Policy {
    pub fn from_read_only(read_only: bool) -> Self {
        if read_only {
            Policy::ReadOnly
        } else {
            Policy::LimitedWrite
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Policy::ReadOnly)
    }

    pub fn forbidden_keywords(&self) -> &'static [&'static str] {
        match self {
            Policy::ReadOnly => FORBIDDEN_KEYWORDS_READONLY,
            Policy::LimitedWrite => ALWAYS_FORBIDDEN,
        }
    }

    /// Rule sentence handed to the SQL generator.
    pub fn prompt_rule(&self) -> &'static str {
        match self {
            Policy::ReadOnly => "Only SELECT allowed. No INSERT/UPDATE/DELETE.",
            Policy::LimitedWrite => "SELECT, INSERT, UPDATE, DELETE allowed. No DROP/TRUNCATE/ALTER.",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::ReadOnly => write!(f, "read_only"),
            Policy::LimitedWrite => write!(f, "limited_write"),
        }
    }
}

/// Outcome of validating a statement against a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self { valid: true, reason: None }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

fn keyword_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        FORBIDDEN_KEYWORDS_READONLY
            .iter()
            .map(|kw| {
                let re = Regex::new(&format!(r"(?i)\b{}\b", kw)).expect("keyword pattern is a literal word");
                (*kw, re)
            })
            .collect()
    })
}

fn pattern_for(keyword: &str) -> Option<&'static Regex> {
    keyword_patterns()
        .iter()
        .find(|(kw, _)| *kw == keyword)
        .map(|(_, re)| re)
}

/// Validate SQL text under the given policy.
///
/// Forbidden keywords are checked first, in list order, so the reported
/// reason names the first keyword of the list that occurs in the statement.
pub fn validate_sql(sql: &str, policy: Policy) -> PolicyDecision {
    for keyword in policy.forbidden_keywords() {
        if let Some(re) = pattern_for(keyword) {
            if re.is_match(sql) {
                return PolicyDecision::deny(format!("SQL contains forbidden keyword: {}.", keyword));
            }
        }
    }

    if policy.is_read_only() {
        let trimmed = sql.trim().to_uppercase();
        if !READONLY_LEADING_KEYWORDS.iter().any(|kw| trimmed.starts_with(kw)) {
            return PolicyDecision::deny("Only SELECT queries are allowed.");
        }
    }

    PolicyDecision::allow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_select_is_valid() {
        assert!(validate_sql("SELECT * FROM users", Policy::ReadOnly).valid);
        assert!(validate_sql("  select id from users", Policy::ReadOnly).valid);
    }

    #[test]
    fn test_cte_is_valid() {
        let sql = "WITH recent AS (SELECT * FROM orders) SELECT count(*) FROM recent";
        assert!(validate_sql(sql, Policy::ReadOnly).valid);
    }

    #[test]
    fn test_stacked_drop_rejected() {
        let decision = validate_sql("select * from users; DROP TABLE users", Policy::ReadOnly);
        assert!(!decision.valid);
        assert_eq!(decision.reason.as_deref(), Some("SQL contains forbidden keyword: DROP."));
    }

    #[test]
    fn test_keyword_substring_is_not_a_match() {
        assert!(validate_sql("SELECT * FROM dropdown_items", Policy::ReadOnly).valid);
        assert!(validate_sql("SELECT updated_at, created_by FROM t", Policy::ReadOnly).valid);
        assert!(validate_sql("SELECT recall FROM executions", Policy::ReadOnly).valid);
    }

    #[test]
    fn test_keyword_inside_subquery_rejected() {
        let sql = "SELECT * FROM (DELETE FROM users RETURNING *) x";
        let decision = validate_sql(sql, Policy::ReadOnly);
        assert!(!decision.valid);
        assert_eq!(decision.reason.as_deref(), Some("SQL contains forbidden keyword: DELETE."));
    }

    #[test]
    fn test_read_only_requires_leading_select() {
        let decision = validate_sql("SHOW TABLES", Policy::ReadOnly);
        assert!(!decision.valid);
        assert_eq!(decision.reason.as_deref(), Some("Only SELECT queries are allowed."));
    }

    #[test]
    fn test_first_violation_in_keyword_order() {
        // INSERT precedes DROP in the text but DROP comes first in the list
        let decision = validate_sql("INSERT INTO a SELECT 1; DROP TABLE b", Policy::ReadOnly);
        assert_eq!(decision.reason.as_deref(), Some("SQL contains forbidden keyword: DROP."));
    }

    #[test]
    fn test_lowercase_keyword_rejected() {
        assert!(!validate_sql("select 1; exec sp_who", Policy::ReadOnly).valid);
    }

    #[test]
    fn test_limited_write_allows_dml() {
        assert!(validate_sql("INSERT INTO t (a) VALUES (1)", Policy::LimitedWrite).valid);
        assert!(validate_sql("UPDATE t SET a = 2", Policy::LimitedWrite).valid);
        assert!(validate_sql("DELETE FROM t WHERE a = 2", Policy::LimitedWrite).valid);
        assert!(validate_sql("CALL refresh_stats()", Policy::LimitedWrite).valid);
    }

    #[test]
    fn test_limited_write_rejects_ddl() {
        for sql in [
            "DROP TABLE t",
            "truncate t",
            "ALTER TABLE t ADD c int",
            "CREATE TABLE x (a int)",
            "GRANT ALL ON t TO bob",
            "REVOKE ALL ON t FROM bob",
        ] {
            assert!(!validate_sql(sql, Policy::LimitedWrite).valid, "{}", sql);
        }
    }
}
