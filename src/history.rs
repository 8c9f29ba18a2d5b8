//! Query history
//!
//! SQLite-backed list of successful queries, newest first, bounded to
//! [`MAX_HISTORY_ITEMS`]. Re-running the same question with the same SQL
//! refreshes the existing entry instead of adding a duplicate.

use crate::error::{QueryError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub const MAX_HISTORY_ITEMS: usize = 50;

/// Receives one record per successful query
pub trait HistorySink: Send + Sync {
    fn record(&self, question: &str, sql: &str, result_count: usize, execution_time: Duration) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    pub question: String,
    pub sql: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub result_count: usize,
    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<u64>,
    #[serde(default)]
    pub is_favorite: bool,
}

pub struct HistoryStore {
    db: Mutex<Connection>,
}

impl HistoryStore {
    /// Open or create a history database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let db = Connection::open(path)
            .map_err(|e| QueryError::History(format!("Failed to open history database: {}", e)))?;
        Self::with_connection(db)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(db: Connection) -> Result<Self> {
        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS query_history (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                sql TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                result_count INTEGER NOT NULL DEFAULT 0,
                execution_time INTEGER,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                seq INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_history_question_sql ON query_history(question, sql)",
            [],
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| QueryError::History("history lock poisoned".to_string()))
    }

    /// Record a query, refreshing an existing (question, sql) entry.
    pub fn add_query(
        &self,
        question: &str,
        sql: &str,
        result_count: usize,
        execution_time: Option<Duration>,
    ) -> Result<HistoryItem> {
        let db = self.conn()?;
        let timestamp = Utc::now().timestamp_millis();
        let execution_ms = execution_time.map(|d| d.as_millis() as u64);
        let seq: i64 = db.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM query_history", [], |row| row.get(0))?;

        let existing: Option<(String, bool)> = db
            .query_row(
                "SELECT id, is_favorite FROM query_history WHERE question = ?1 AND sql = ?2",
                params![question, sql],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let item = match existing {
            Some((id, is_favorite)) => {
                db.execute(
                    r#"
                    UPDATE query_history
                    SET timestamp = ?2, result_count = ?3, execution_time = ?4, seq = ?5
                    WHERE id = ?1
                    "#,
                    params![id, timestamp, result_count as i64, execution_ms.map(|ms| ms as i64), seq],
                )?;
                debug!("Refreshed history entry {}", id);
                HistoryItem {
                    id,
                    question: question.to_string(),
                    sql: sql.to_string(),
                    timestamp,
                    result_count,
                    execution_time: execution_ms,
                    is_favorite,
                }
            }
            None => {
                let item = HistoryItem {
                    id: Uuid::new_v4().to_string(),
                    question: question.to_string(),
                    sql: sql.to_string(),
                    timestamp,
                    result_count,
                    execution_time: execution_ms,
                    is_favorite: false,
                };
                insert_item(&db, &item, seq)?;
                item
            }
        };

        let trimmed = db.execute(
            "DELETE FROM query_history WHERE id NOT IN (SELECT id FROM query_history ORDER BY seq DESC LIMIT ?1)",
            params![MAX_HISTORY_ITEMS as i64],
        )?;
        if trimmed > 0 {
            debug!("Trimmed {} old history entries", trimmed);
        }

        Ok(item)
    }

    /// All entries, newest first
    pub fn history(&self) -> Result<Vec<HistoryItem>> {
        self.select("1 = 1", params![])
    }

    pub fn favorites(&self) -> Result<Vec<HistoryItem>> {
        self.select("is_favorite = 1", params![])
    }

    /// Case-insensitive match on question or SQL
    pub fn search(&self, text: &str) -> Result<Vec<HistoryItem>> {
        let needle = text.to_lowercase();
        Ok(self
            .history()?
            .into_iter()
            .filter(|item| item.question.to_lowercase().contains(&needle) || item.sql.to_lowercase().contains(&needle))
            .collect())
    }

    /// Flip the favorite flag; returns false when the id is unknown.
    pub fn toggle_favorite(&self, id: &str) -> Result<bool> {
        let db = self.conn()?;
        let changed = db.execute(
            "UPDATE query_history SET is_favorite = 1 - is_favorite WHERE id = ?1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let db = self.conn()?;
        Ok(db.execute("DELETE FROM query_history WHERE id = ?1", params![id])? > 0)
    }

    pub fn clear(&self, keep_favorites: bool) -> Result<()> {
        let db = self.conn()?;
        if keep_favorites {
            db.execute("DELETE FROM query_history WHERE is_favorite = 0", [])?;
        } else {
            db.execute("DELETE FROM query_history", [])?;
        }
        Ok(())
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.history()?)?)
    }

    /// Replace the history with an exported list. Returns false, leaving the
    /// store untouched, when the text is not a list of history items.
    pub fn import_json(&self, text: &str) -> Result<bool> {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return Ok(false);
        };
        let Some(entries) = value.as_array() else {
            return Ok(false);
        };

        let well_formed = entries.iter().all(|e| {
            e.get("id").map_or(false, |v| v.is_string())
                && e.get("question").map_or(false, |v| v.is_string())
                && e.get("sql").map_or(false, |v| v.is_string())
                && e.get("timestamp").map_or(false, |v| v.is_number())
        });
        if !well_formed {
            return Ok(false);
        }

        let Ok(mut items) = serde_json::from_value::<Vec<HistoryItem>>(value) else {
            return Ok(false);
        };
        items.sort_by_key(|item| item.timestamp);

        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM query_history", [])?;
        for (seq, item) in items.iter().enumerate() {
            insert_item(&tx, item, seq as i64 + 1)?;
        }
        tx.commit()?;

        info!("Imported {} history entries", items.len());
        Ok(true)
    }

    fn select(&self, filter: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<HistoryItem>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT id, question, sql, timestamp, result_count, execution_time, is_favorite
             FROM query_history WHERE {} ORDER BY seq DESC",
            filter
        ))?;

        let items = stmt
            .query_map(params, |row| {
                Ok(HistoryItem {
                    id: row.get(0)?,
                    question: row.get(1)?,
                    sql: row.get(2)?,
                    timestamp: row.get(3)?,
                    result_count: row.get::<_, i64>(4)?.max(0) as usize,
                    execution_time: row.get::<_, Option<i64>>(5)?.map(|ms| ms.max(0) as u64),
                    is_favorite: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(items)
    }
}

fn insert_item(db: &Connection, item: &HistoryItem, seq: i64) -> Result<()> {
    db.execute(
        r#"
        INSERT OR REPLACE INTO query_history
        (id, question, sql, timestamp, result_count, execution_time, is_favorite, seq)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            item.id,
            item.question,
            item.sql,
            item.timestamp,
            item.result_count as i64,
            item.execution_time.map(|ms| ms as i64),
            item.is_favorite,
            seq,
        ],
    )?;
    Ok(())
}

impl HistorySink for HistoryStore {
    fn record(&self, question: &str, sql: &str, result_count: usize, execution_time: Duration) -> Result<()> {
        self.add_query(question, sql, result_count, Some(execution_time)).map(|_| ())
    }
}
