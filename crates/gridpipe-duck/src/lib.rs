//! DuckDB executor for local table operations

use std::path::Path;

use duckdb::{Connection, Result as DuckResult};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("Table file path is not valid UTF-8: {0}")]
    InvalidPath(String),
}

/// In-memory DuckDB instance that loads JSONL files as named tables and
/// runs SELECT statements over them.
pub struct TableEngine {
    conn: Connection,
}

impl TableEngine {
    pub fn new() -> DuckResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Load a newline-delimited JSON file as `table`, replacing any
    /// previous table of that name.
    pub fn load_table(&self, table: &str, file: &Path) -> Result<(), EngineError> {
        let path = file
            .to_str()
            .ok_or_else(|| EngineError::InvalidPath(file.display().to_string()))?;
        let sql = format!(
            "CREATE OR REPLACE TABLE {} AS SELECT * FROM read_json_auto('{}', format='newline_delimited')",
            table,
            path.replace('\'', "''"),
        );

        debug!(table = %table, "loading table");
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    /// Run a SELECT statement and collect the full result set.
    pub fn run(&self, sql: &str) -> Result<QueryResult, EngineError> {
        debug!(sql = %sql, "running statement");

        let mut stmt = self.conn.prepare(sql)?;

        // Extract column names before executing
        let column_count = stmt.column_count();
        let column_names: Vec<String> = (0..column_count)
            .map(|i| stmt.column_name(i).unwrap_or(&"unknown".to_string()).to_string())
            .collect();

        let mut rows = stmt.query([])?;

        let mut result_rows = Vec::new();
        let mut row_count = 0;

        while let Some(row) = rows.next()? {
            let mut json_row = Vec::new();

            for i in 0..column_count {
                // Convert each cell to JSON value
                let value_ref = row.get_ref(i)?;
                let value: serde_json::Value = match value_ref {
                    duckdb::types::ValueRef::Null => serde_json::Value::Null,
                    duckdb::types::ValueRef::Boolean(b) => serde_json::Value::Bool(b),
                    duckdb::types::ValueRef::TinyInt(i) => serde_json::Value::from(i),
                    duckdb::types::ValueRef::SmallInt(i) => serde_json::Value::from(i),
                    duckdb::types::ValueRef::Int(i) => serde_json::Value::from(i),
                    duckdb::types::ValueRef::BigInt(i) => serde_json::Value::from(i),
                    duckdb::types::ValueRef::UTinyInt(i) => serde_json::Value::from(i),
                    duckdb::types::ValueRef::USmallInt(i) => serde_json::Value::from(i),
                    duckdb::types::ValueRef::UInt(i) => serde_json::Value::from(i),
                    duckdb::types::ValueRef::UBigInt(i) => serde_json::Value::from(i),
                    // SUM over integer columns comes back as HUGEINT
                    duckdb::types::ValueRef::HugeInt(i) => match i64::try_from(i) {
                        Ok(v) => serde_json::Value::from(v),
                        Err(_) => serde_json::json!(i as f64),
                    },
                    duckdb::types::ValueRef::Float(f) => serde_json::json!(f),
                    duckdb::types::ValueRef::Double(f) => serde_json::json!(f),
                    duckdb::types::ValueRef::Text(bytes) => {
                        // Convert bytes to UTF-8 string
                        let s = std::str::from_utf8(bytes).unwrap_or("");
                        serde_json::Value::String(s.to_string())
                    },
                    _ => serde_json::Value::Null,  // TODO: temporal and nested values
                };

                json_row.push(value);
            }

            result_rows.push(json_row);
            row_count += 1;
        }

        Ok(QueryResult {
            columns: column_names,
            rows: result_rows,
            row_count,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[derive(Debug)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
}

impl QueryResult {
    /// Pair each row up with the column names. Null cells are kept, so
    /// unmatched join columns survive as explicit nulls.
    pub fn to_rows(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}
