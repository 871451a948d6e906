use crate::core::Value;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashSet;

pub type Row = Vec<Value>;

/// Outcome of one statement as reported by a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Command tag, e.g. `SELECT`, `INSERT`.
    pub command: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Rows returned for queries, rows affected for DML.
    pub row_count: u64,
}

impl QueryResult {
    pub fn empty(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
        }
    }

    pub fn with_rows(command: impl Into<String>, columns: Vec<String>, rows: Vec<Row>) -> Self {
        let row_count = rows.len() as u64;
        Self {
            command: command.into(),
            columns,
            rows,
            row_count,
        }
    }

    pub fn affected(command: impl Into<String>, row_count: u64) -> Self {
        Self {
            command: command.into(),
            columns: Vec::new(),
            rows: Vec::new(),
            row_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as JSON objects keyed by column name.
    ///
    /// A repeated column name gets a numeric suffix (`id`, `id_2`, ...) so
    /// no value is dropped.
    pub fn rows_as_objects(&self) -> Vec<JsonMap<String, JsonValue>> {
        let keys = self.object_keys();
        self.rows
            .iter()
            .map(|row| {
                keys.iter()
                    .zip(row.iter())
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect()
            })
            .collect()
    }

    fn object_keys(&self) -> Vec<String> {
        let mut seen = HashSet::with_capacity(self.columns.len());
        self.columns
            .iter()
            .map(|column| {
                let mut key = column.clone();
                let mut n = 1;
                while !seen.insert(key.clone()) {
                    n += 1;
                    key = format!("{}_{}", column, n);
                }
                key
            })
            .collect()
    }

    pub fn to_statement_result(&self) -> StatementResult {
        StatementResult {
            rows: self.rows_as_objects(),
            row_count: self.row_count,
            command: self.command.clone(),
        }
    }
}

/// Wire shape of a single statement's result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementResult {
    pub rows: Vec<JsonMap<String, JsonValue>>,
    pub row_count: u64,
    pub command: String,
}

/// Command tag of a statement: its first keyword, upper-cased.
pub fn command_tag(sql: &str) -> String {
    sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| c.is_whitespace() || c == ';' || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// Whether a statement can be served by a read-only replica.
pub fn is_read_command(sql: &str) -> bool {
    matches!(
        command_tag(sql).as_str(),
        "SELECT" | "WITH" | "SHOW" | "EXPLAIN" | "VALUES" | "TABLE"
    )
}

/// Whether a statement opens, ends or marks a transaction. These are only
/// issued by the connection itself, never taken from callers.
pub fn is_transaction_control(sql: &str) -> bool {
    matches!(
        command_tag(sql).as_str(),
        "BEGIN" | "START" | "COMMIT" | "END" | "ROLLBACK" | "ABORT" | "SAVEPOINT" | "RELEASE"
    )
}
