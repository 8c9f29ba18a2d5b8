//! Schema Anonymizer
//!
//! Replaces table and column names with positional placeholders
//! (`table_<n>`, `col_<n>`) before a schema is shown to the SQL generator,
//! and translates generated SQL back to real identifiers afterwards.
//!
//! Translation works on SQL tokens rather than raw text: string literals and
//! comments are never rewritten, and a column placeholder is resolved through
//! its qualifier (`table_2.col_1`, or an alias bound in FROM/JOIN) so that
//! `col_1` of one table is never confused with `col_1` of another.

use crate::schema::{ForeignKey, Schema, Table};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Name lookup in one direction (real -> anonymous or anonymous -> real).
///
/// Keys are lowercased source names, values are target names as written.
#[derive(Debug, Default)]
struct NameIndex {
    tables: HashMap<String, String>,
    columns: HashMap<String, HashMap<String, String>>,
    /// Lowercased source table names in declaration order
    order: Vec<String>,
}

impl NameIndex {
    fn insert_table(&mut self, from: &str, to: &str) {
        let key = from.to_lowercase();
        if self.tables.contains_key(&key) {
            return;
        }
        self.tables.insert(key.clone(), to.to_string());
        self.columns.insert(key.clone(), HashMap::new());
        self.order.push(key);
    }

    fn insert_column(&mut self, table: &str, from: &str, to: &str) {
        if let Some(cols) = self.columns.get_mut(&table.to_lowercase()) {
            cols.entry(from.to_lowercase()).or_insert_with(|| to.to_string());
        }
    }

    fn table(&self, name: &str) -> Option<&str> {
        self.tables.get(&name.to_lowercase()).map(String::as_str)
    }

    fn column(&self, table: &str, column: &str) -> Option<&str> {
        self.columns
            .get(&table.to_lowercase())
            .and_then(|cols| cols.get(&column.to_lowercase()))
            .map(String::as_str)
    }
}

/// Bidirectional real <-> placeholder identifier map for one request.
///
/// Not `Clone` and not serializable: a map lives exactly as long as the
/// request that built it.
#[derive(Debug, Default)]
pub struct AnonymizationMap {
    forward: NameIndex,
    reverse: NameIndex,
}

impl AnonymizationMap {
    pub fn anonymous_table(&self, real: &str) -> Option<&str> {
        self.forward.table(real)
    }

    pub fn real_table(&self, anonymous: &str) -> Option<&str> {
        self.reverse.table(anonymous)
    }

    pub fn anonymous_column(&self, real_table: &str, real_column: &str) -> Option<&str> {
        self.forward.column(real_table, real_column)
    }

    pub fn real_column(&self, anonymous_table: &str, anonymous_column: &str) -> Option<&str> {
        self.reverse.column(anonymous_table, anonymous_column)
    }

    pub fn table_count(&self) -> usize {
        self.reverse.order.len()
    }

    /// Rewrite placeholders in generated SQL back to real identifiers.
    pub fn deanonymize(&self, sql: &str) -> String {
        rewrite(sql, &self.reverse)
    }

    /// Rewrite real identifiers into placeholders, for text that goes back to
    /// the generator (failed statements, database error messages).
    pub fn anonymize_text(&self, text: &str) -> String {
        rewrite(text, &self.forward)
    }

    /// Placeholder names for the result columns of a (real) statement.
    /// Columns of tables referenced by `sql` win over other tables; names
    /// that are not schema identifiers, such as expression aliases, are kept.
    pub fn anonymize_columns(&self, sql: &str, columns: &[String]) -> Vec<String> {
        let tokens = tokenize(sql);
        let (scope, _) = collect_scope(&tokens, &self.forward);

        columns
            .iter()
            .map(|name| {
                column_in_scope(&self.forward, &scope, name)
                    .or_else(|| column_in_scope(&self.forward, &self.forward.order, name))
                    .or_else(|| self.forward.table(name))
                    .unwrap_or(name.as_str())
                    .to_string()
            })
            .collect()
    }
}

/// Anonymize a schema, returning the placeholder schema and the map.
///
/// Key references that cannot be resolved through the map are dropped rather
/// than carried over with their real names.
pub fn anonymize(schema: &Schema) -> (Schema, AnonymizationMap) {
    let mut map = AnonymizationMap::default();

    // All names first, so foreign keys may point at tables declared later.
    for (table_idx, table) in schema.tables.iter().enumerate() {
        let anon_table = format!("table_{}", table_idx + 1);
        map.forward.insert_table(&table.name, &anon_table);
        map.reverse.insert_table(&anon_table, &table.name);

        for (col_idx, column) in table.columns.iter().enumerate() {
            let anon_col = format!("col_{}", col_idx + 1);
            map.forward.insert_column(&table.name, &column.name, &anon_col);
            map.reverse.insert_column(&anon_table, &anon_col, &column.name);
        }
    }

    let tables = schema
        .tables
        .iter()
        .enumerate()
        .map(|(table_idx, table)| anonymize_table(table, table_idx, &map))
        .collect();

    debug!("Anonymized schema with {} tables", map.table_count());
    (Schema { tables }, map)
}

/// Free-function form of [`AnonymizationMap::deanonymize`].
pub fn deanonymize(sql: &str, map: &AnonymizationMap) -> String {
    map.deanonymize(sql)
}

fn anonymize_table(table: &Table, table_idx: usize, map: &AnonymizationMap) -> Table {
    let anon_table = format!("table_{}", table_idx + 1);

    let columns = table
        .columns
        .iter()
        .enumerate()
        .map(|(col_idx, column)| {
            let mut anon = column.clone();
            anon.name = format!("col_{}", col_idx + 1);
            // Defaults can embed identifiers (sequence names, functions)
            anon.default_value = None;
            anon
        })
        .collect();

    let primary_key = table.primary_key.as_ref().map(|pk| {
        pk.iter()
            .filter_map(|col| {
                let anon = map.anonymous_column(&table.name, col);
                if anon.is_none() {
                    warn!("Dropping unresolvable primary key entry on {}", anon_table);
                }
                anon.map(str::to_string)
            })
            .collect::<Vec<_>>()
    });

    let foreign_keys = table.foreign_keys.as_ref().map(|fks| {
        fks.iter()
            .enumerate()
            .filter_map(|(fk_idx, fk)| {
                let anon = anonymize_foreign_key(&table.name, fk, map);
                if anon.is_none() {
                    warn!(
                        "Dropping foreign key #{} on {}: reference not found in schema",
                        fk_idx + 1,
                        anon_table
                    );
                }
                anon
            })
            .collect::<Vec<_>>()
    });

    Table {
        name: anon_table,
        columns,
        primary_key,
        foreign_keys,
        row_count: table.row_count,
    }
}

fn anonymize_foreign_key(table: &str, fk: &ForeignKey, map: &AnonymizationMap) -> Option<ForeignKey> {
    Some(ForeignKey {
        column: map.anonymous_column(table, &fk.column)?.to_string(),
        references_table: map.anonymous_table(&fk.references_table)?.to_string(),
        references_column: map
            .anonymous_column(&fk.references_table, &fk.references_column)?
            .to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    Word(&'a str),
    Quoted { quote: char, body: &'a str },
    /// Whitespace, comments, string literals and punctuation; copied verbatim
    Other(&'a str),
}

impl<'a> Token<'a> {
    fn ident(&self) -> Option<&'a str> {
        match self {
            Token::Word(w) => Some(*w),
            Token::Quoted { body, .. } => Some(*body),
            Token::Other(_) => None,
        }
    }

    fn is_trivia(&self) -> bool {
        match self {
            Token::Other(s) => s.trim().is_empty() || s.starts_with("--") || s.starts_with("/*"),
            _ => false,
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn tokenize(sql: &str) -> Vec<Token<'_>> {
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let end_of = |i: usize| chars.get(i).map(|(pos, _)| *pos).unwrap_or(sql.len());
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (start, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if is_word_char(c) {
            while i < chars.len() && is_word_char(chars[i].1) {
                i += 1;
            }
            tokens.push(Token::Word(&sql[start..end_of(i)]));
        } else if c == '\'' {
            i += 1;
            while i < chars.len() {
                if chars[i].1 == '\'' {
                    if chars.get(i + 1).map(|(_, c)| *c) == Some('\'') {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(Token::Other(&sql[start..end_of(i)]));
        } else if c == '"' || c == '`' {
            let body_start = i + 1;
            let mut j = body_start;
            while j < chars.len() && chars[j].1 != c {
                j += 1;
            }
            if j < chars.len() {
                tokens.push(Token::Quoted {
                    quote: c,
                    body: &sql[end_of(body_start)..end_of(j)],
                });
                i = j + 1;
            } else {
                tokens.push(Token::Other(&sql[start..]));
                i = chars.len();
            }
        } else if c == '-' && next == Some('-') {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            tokens.push(Token::Other(&sql[start..end_of(i)]));
        } else if c == '/' && next == Some('*') {
            i += 2;
            while i < chars.len() && !(chars[i].1 == '*' && chars.get(i + 1).map(|(_, c)| *c) == Some('/')) {
                i += 1;
            }
            i = (i + 2).min(chars.len());
            tokens.push(Token::Other(&sql[start..end_of(i)]));
        } else {
            i += 1;
            tokens.push(Token::Other(&sql[start..end_of(i)]));
        }
    }

    tokens
}

/// Words that can follow a table reference without being its alias.
const NOT_AN_ALIAS: &[&str] = &[
    "ON", "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "OUTER", "NATURAL", "GROUP",
    "ORDER", "LIMIT", "OFFSET", "HAVING", "UNION", "EXCEPT", "INTERSECT", "SET", "VALUES", "USING",
    "WINDOW", "RETURNING", "FOR", "LATERAL", "AND", "OR", "SELECT", "FROM", "AS", "WHEN", "THEN",
    "ELSE", "END", "FETCH",
];

fn next_significant(tokens: &[Token<'_>], from: usize) -> Option<usize> {
    (from..tokens.len()).find(|&i| !tokens[i].is_trivia())
}

/// The identifier before a `.` directly preceding token `idx`, if any.
fn qualifier_of<'a>(tokens: &[Token<'a>], idx: usize) -> Option<&'a str> {
    if idx < 2 || tokens[idx - 1] != Token::Other(".") {
        return None;
    }
    tokens[idx - 2].ident()
}

/// Tables referenced by the statement, in order of first appearance, plus
/// alias bindings. All keys are lowercased source names.
fn collect_scope(tokens: &[Token<'_>], index: &NameIndex) -> (Vec<String>, HashMap<String, String>) {
    let mut scope: Vec<String> = Vec::new();
    let mut aliases = HashMap::new();

    for (idx, token) in tokens.iter().enumerate() {
        let Some(name) = token.ident() else { continue };
        let key = name.to_lowercase();
        if !index.tables.contains_key(&key) {
            continue;
        }
        // `x.<table>` is schema-qualified; `<table>.col` is a qualifier use.
        if tokens.get(idx + 1) == Some(&Token::Other(".")) {
            if !scope.contains(&key) {
                scope.push(key);
            }
            continue;
        }
        if !scope.contains(&key) {
            scope.push(key.clone());
        }

        let Some(mut next) = next_significant(tokens, idx + 1) else { continue };
        if let Token::Word(w) = tokens[next] {
            if w.eq_ignore_ascii_case("AS") {
                match next_significant(tokens, next + 1) {
                    Some(n) => next = n,
                    None => continue,
                }
            }
        }
        if let Some(alias) = tokens[next].ident() {
            let is_keyword = matches!(tokens[next], Token::Word(w) if NOT_AN_ALIAS.iter().any(|k| k.eq_ignore_ascii_case(w)));
            let alias_key = alias.to_lowercase();
            if !is_keyword && !index.tables.contains_key(&alias_key) {
                aliases.insert(alias_key, key);
            }
        }
    }

    (scope, aliases)
}

fn resolve_qualifier(index: &NameIndex, aliases: &HashMap<String, String>, qualifier: &str) -> Option<String> {
    let key = qualifier.to_lowercase();
    if index.tables.contains_key(&key) {
        Some(key)
    } else {
        aliases.get(&key).cloned()
    }
}

fn column_in_scope<'a>(index: &'a NameIndex, search_order: &[String], name: &str) -> Option<&'a str> {
    search_order.iter().find_map(|table| index.column(table, name))
}

fn rewrite(sql: &str, index: &NameIndex) -> String {
    let tokens = tokenize(sql);
    let (scope, aliases) = collect_scope(&tokens, index);
    let search_order: &[String] = if scope.is_empty() { &index.order } else { &scope };

    let mut out = String::with_capacity(sql.len());
    for (idx, token) in tokens.iter().enumerate() {
        let Some(name) = token.ident() else {
            if let Token::Other(s) = token {
                out.push_str(s);
            }
            continue;
        };

        let replacement = match qualifier_of(&tokens, idx) {
            Some(qualifier) => match resolve_qualifier(index, &aliases, qualifier) {
                Some(table) => index.column(&table, name).or_else(|| index.table(name)),
                None => index
                    .table(name)
                    .or_else(|| column_in_scope(index, search_order, name)),
            },
            None => index
                .table(name)
                .or_else(|| column_in_scope(index, search_order, name)),
        };

        let text = replacement.unwrap_or(name);
        match token {
            Token::Quoted { quote, .. } => {
                out.push(*quote);
                out.push_str(text);
                out.push(*quote);
            }
            _ => out.push_str(text),
        }
    }

    out
}
