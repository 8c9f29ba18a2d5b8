//! Error Classifier
//!
//! Classifies database error messages into a taxonomy used for logging and
//! for targeting repair prompts.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// SQL error classification taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlErrorClass {
    ColumnNotFound,
    TableNotFound,
    Syntax,
    Timeout,
    PermissionDenied,
    Other,
}

impl fmt::Display for SqlErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlErrorClass::ColumnNotFound => write!(f, "ColumnNotFound"),
            SqlErrorClass::TableNotFound => write!(f, "TableNotFound"),
            SqlErrorClass::Syntax => write!(f, "Syntax"),
            SqlErrorClass::Timeout => write!(f, "Timeout"),
            SqlErrorClass::PermissionDenied => write!(f, "PermissionDenied"),
            SqlErrorClass::Other => write!(f, "Other"),
        }
    }
}

/// Error classifier
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a raw database error message
    pub fn classify(&self, message: &str) -> SqlErrorClass {
        let msg = message.to_lowercase();

        if msg.contains("unknown column")
            || (msg.contains("column") && (msg.contains("does not exist") || msg.contains("not found")))
        {
            return SqlErrorClass::ColumnNotFound;
        }

        if (msg.contains("relation") || msg.contains("table"))
            && (msg.contains("does not exist") || msg.contains("doesn't exist") || msg.contains("not found"))
        {
            return SqlErrorClass::TableNotFound;
        }

        if msg.contains("timed out")
            || msg.contains("statement timeout")
            || msg.contains("maximum statement execution time")
        {
            return SqlErrorClass::Timeout;
        }

        if msg.contains("permission denied") || msg.contains("access denied") || msg.contains("command denied") {
            return SqlErrorClass::PermissionDenied;
        }

        if msg.contains("syntax") {
            return SqlErrorClass::Syntax;
        }

        SqlErrorClass::Other
    }
}

fn invalid_column_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // PostgreSQL
            Regex::new(r#"(?i)column "([^"]+)" does not exist"#).expect("literal pattern"),
            // MySQL
            Regex::new(r"(?i)Unknown column '([^']+)'").expect("literal pattern"),
        ]
    })
}

/// Column name a PostgreSQL or MySQL error message complains about.
pub fn extract_invalid_column(message: &str) -> Option<String> {
    invalid_column_patterns()
        .iter()
        .find_map(|re| re.captures(message))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
