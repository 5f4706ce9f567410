//! Read-only access to the analytical data store.
//!
//! The store is a pooled SQLite handle injected into the workflow at
//! startup. Every statement passes [`check_read_only`] first, and the
//! connections themselves are opened read-only.

use crate::config::DatabaseConfig;
use crate::error::ToolError;
use crate::models::Row;
use anyhow::{Context, Result};
use serde_json::{Number, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use tracing::{debug, info, warn};

/// Statements that may never appear, even inside a CTE.
///
/// None of these double as SQLite function names. `REPLACE` does (the string
/// function), so it is only rejected as `REPLACE INTO`.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "create", "alter", "attach", "detach", "vacuum",
    "reindex", "truncate", "grant", "upsert",
];

/// Kind of retrieval statement accepted by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    TableInfo,
}

/// A statement that passed the read-only policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedStatement {
    pub sql: String,
    pub kind: StatementKind,
}

/// Pooled, read-only data store.
#[derive(Clone)]
pub struct DataStore {
    pool: SqlitePool,
    max_rows: usize,
    sample_size: usize,
}

impl DataStore {
    /// Open the configured database read-only.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Opening data store at: {}", config.path.display());

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .read_only(true)
            .create_if_missing(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {}", config.path.display()))?;

        debug!("Data store pool ready ({} connections)", config.max_connections);

        Ok(Self::from_pool(pool, config.max_rows, config.sample_size))
    }

    pub fn from_pool(pool: SqlitePool, max_rows: usize, sample_size: usize) -> Self {
        Self {
            pool,
            max_rows,
            sample_size,
        }
    }

    /// Run one retrieval statement.
    ///
    /// When the natural result exceeds the row ceiling, a random sample of
    /// `sample_size` rows is returned instead of a truncated prefix.
    pub async fn execute(&self, query: &str) -> Result<Vec<Row>, ToolError> {
        let statement = check_read_only(query)?;
        info!("Executing SQL query: {}", statement.sql);

        if statement.kind == StatementKind::Select {
            let count_sql = format!("SELECT COUNT(*) FROM ({})", statement.sql);
            let count: i64 = sqlx::query_scalar(&count_sql)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?;

            if count as usize > self.max_rows {
                warn!(
                    "Query returned {} rows (ceiling {}); sampling {} random rows",
                    count, self.max_rows, self.sample_size
                );
                let sample_sql = format!(
                    "SELECT * FROM ({}) ORDER BY RANDOM() LIMIT {}",
                    statement.sql, self.sample_size
                );
                let rows = self.fetch(&sample_sql).await?;
                info!("Random sampling applied, returning {} rows", rows.len());
                return Ok(rows);
            }
        }

        let rows = self.fetch(&statement.sql).await?;
        info!("Query executed successfully, retrieved {} rows", rows.len());
        Ok(rows)
    }

    async fn fetch(&self, sql: &str) -> Result<Vec<Row>, ToolError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        rows.iter().map(row_to_json).collect()
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Data store closed");
    }
}

/// Enforce the single-retrieval-statement policy.
pub fn check_read_only(query: &str) -> Result<CheckedStatement, ToolError> {
    let code = strip_literals_and_comments(query);
    let trimmed_code = code.trim().trim_end_matches(';').trim_end();

    if trimmed_code.is_empty() {
        return Err(ToolError::SqlPolicy("empty statement".to_string()));
    }
    if trimmed_code.contains(';') {
        return Err(ToolError::SqlPolicy(
            "only a single statement is allowed".to_string(),
        ));
    }

    let lowered = trimmed_code.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();

    if let Some(bad) = words.iter().find(|w| FORBIDDEN_KEYWORDS.contains(w)) {
        return Err(ToolError::SqlPolicy(format!(
            "'{}' statements are not allowed",
            bad.to_uppercase()
        )));
    }
    if words.windows(2).any(|pair| pair == ["replace", "into"]) {
        return Err(ToolError::SqlPolicy(
            "'REPLACE' statements are not allowed".to_string(),
        ));
    }

    let kind = match words.first().copied() {
        Some("select") | Some("with") => StatementKind::Select,
        Some("pragma") if words.get(1) == Some(&"table_info") => StatementKind::TableInfo,
        Some(other) => {
            return Err(ToolError::SqlPolicy(format!(
                "only SELECT statements are allowed, got '{}'",
                other.to_uppercase()
            )))
        }
        None => return Err(ToolError::SqlPolicy("empty statement".to_string())),
    };

    // Keep the caller's literals; only drop the trailing terminator.
    let sql = query.trim().trim_end_matches(';').trim_end().to_string();
    Ok(CheckedStatement { sql, kind })
}

/// Blank out string literals and comments so keyword checks only see code.
fn strip_literals_and_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                let quote = c;
                out.push(' ');
                while let Some(inner) = chars.next() {
                    if inner == quote {
                        // Doubled quote is an escaped quote.
                        if chars.peek() == Some(&quote) {
                            chars.next();
                            continue;
                        }
                        break;
                    }
                }
                out.push(' ');
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
                out.push('\n');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
                out.push(' ');
            }
            other => out.push(other),
        }
    }

    out
}

fn row_to_json(row: &SqliteRow) -> Result<Row, ToolError> {
    let mut out = Row::new();

    for (i, column) in row.columns().iter().enumerate() {
        let type_name = {
            let raw = row
                .try_get_raw(i)
                .map_err(|e| ToolError::Execution(e.to_string()))?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };

        let value = match type_name.as_deref() {
            None | Some("NULL") => Value::Null,
            Some("INTEGER") | Some("BOOLEAN") => Value::from(decode::<i64>(row, i)?),
            Some("REAL") => Number::from_f64(decode::<f64>(row, i)?)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Some("BLOB") => {
                let bytes = decode::<Vec<u8>>(row, i)?;
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            }
            Some(_) => Value::String(decode::<String>(row, i)?),
        };

        out.insert(column.name().to_string(), value);
    }

    Ok(out)
}

fn decode<'r, T>(row: &'r SqliteRow, index: usize) -> Result<T, ToolError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get_unchecked::<T, _>(index)
        .map_err(|e| ToolError::Execution(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with_rows(rows: usize, max_rows: usize, sample_size: usize) -> DataStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query(
            "CREATE TABLE reservations (ROOM_CATEGORY_LABEL TEXT, NIGHTS INTEGER, RATE REAL, NOTE TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();

        for i in 0..rows {
            sqlx::query("INSERT INTO reservations VALUES (?, ?, ?, NULL)")
                .bind(if i % 2 == 0 { "Villa" } else { "Suite" })
                .bind(i as i64)
                .bind(100.5 + i as f64)
                .execute(&pool)
                .await
                .unwrap();
        }

        DataStore::from_pool(pool, max_rows, sample_size)
    }

    #[test]
    fn test_policy_accepts_retrieval() {
        let stmt = check_read_only("SELECT a FROM t;").unwrap();
        assert_eq!(stmt.kind, StatementKind::Select);
        assert_eq!(stmt.sql, "SELECT a FROM t");

        let stmt = check_read_only("WITH x AS (SELECT 1) SELECT * FROM x").unwrap();
        assert_eq!(stmt.kind, StatementKind::Select);

        let stmt = check_read_only("PRAGMA table_info('reservations')").unwrap();
        assert_eq!(stmt.kind, StatementKind::TableInfo);
    }

    #[test]
    fn test_policy_rejects_writes_and_batches() {
        for sql in [
            "DELETE FROM reservations",
            "DROP TABLE reservations",
            "SELECT 1; DROP TABLE reservations",
            "WITH gone AS (DELETE FROM t RETURNING *) SELECT * FROM gone",
            "PRAGMA journal_mode = WAL",
            "REPLACE INTO reservations VALUES ('Villa', 1, 1.0, NULL)",
            "WITH x AS (SELECT 1) REPLACE INTO t SELECT * FROM x",
            "   ",
        ] {
            assert!(
                matches!(check_read_only(sql), Err(ToolError::SqlPolicy(_))),
                "accepted: {sql}"
            );
        }
    }

    #[test]
    fn test_policy_accepts_replace_function() {
        let stmt = check_read_only(
            "SELECT REPLACE(ROOM_CATEGORY_LABEL, '_', ' ') AS label FROM reservations",
        )
        .unwrap();
        assert_eq!(stmt.kind, StatementKind::Select);
    }

    #[tokio::test]
    async fn test_execute_runs_string_functions() {
        let store = store_with_rows(1, 10, 5).await;
        let rows = store
            .execute("SELECT replace(ROOM_CATEGORY_LABEL, 'V', 'v') AS label FROM reservations")
            .await
            .unwrap();
        assert_eq!(rows[0]["label"], json!("villa"));
    }

    #[test]
    fn test_policy_ignores_keywords_in_literals_and_comments() {
        assert!(check_read_only("SELECT * FROM t WHERE note = 'drop; delete'").is_ok());
        assert!(check_read_only("SELECT 1 -- update later\n").is_ok());
        assert!(check_read_only("SELECT /* insert */ 1").is_ok());
    }

    #[tokio::test]
    async fn test_execute_returns_typed_rows_in_column_order() {
        let store = store_with_rows(3, 1000, 1000).await;
        let rows = store
            .execute("SELECT ROOM_CATEGORY_LABEL, NIGHTS, RATE, NOTE FROM reservations ORDER BY NIGHTS")
            .await
            .unwrap();

        assert_eq!(rows.len(), 3);
        let keys: Vec<_> = rows[0].keys().cloned().collect();
        assert_eq!(keys, vec!["ROOM_CATEGORY_LABEL", "NIGHTS", "RATE", "NOTE"]);
        assert_eq!(rows[0]["ROOM_CATEGORY_LABEL"], json!("Villa"));
        assert_eq!(rows[1]["NIGHTS"], json!(1));
        assert_eq!(rows[0]["RATE"], json!(100.5));
        assert_eq!(rows[0]["NOTE"], Value::Null);
    }

    #[tokio::test]
    async fn test_execute_samples_over_ceiling() {
        let store = store_with_rows(30, 10, 5).await;
        let rows = store.execute("SELECT NIGHTS FROM reservations").await.unwrap();
        assert_eq!(rows.len(), 5);

        let small = store
            .execute("SELECT ROOM_CATEGORY_LABEL, COUNT(*) AS n FROM reservations GROUP BY 1")
            .await
            .unwrap();
        assert_eq!(small.len(), 2);
    }

    #[tokio::test]
    async fn test_execute_rejects_before_touching_the_pool() {
        let store = store_with_rows(1, 10, 5).await;
        let err = store.execute("UPDATE reservations SET NIGHTS = 0").await;
        tokio_test::assert_err!(err);

        let rows = store.execute("SELECT NIGHTS FROM reservations").await.unwrap();
        assert_eq!(rows[0]["NIGHTS"], json!(0));
    }
}
