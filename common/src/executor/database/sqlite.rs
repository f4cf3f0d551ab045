// SQLite query executor

use crate::errors::ExecutionError;
use crate::models::ResultSet;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row};
use std::str::FromStr;
use std::time::Duration;

/// SQLite query executor for file-based report databases
pub struct SqliteExecutor {
    timeout: Duration,
}

impl SqliteExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run the query against an existing database file opened read-only
    #[tracing::instrument(
        skip(self, connection_string, query),
        fields(database_type = "sqlite")
    )]
    pub async fn fetch(
        &self,
        connection_string: &str,
        query: &str,
    ) -> Result<ResultSet, ExecutionError> {
        let options = SqliteConnectOptions::from_str(connection_string)
            .map_err(|e| {
                ExecutionError::DatabaseConnectionFailed(format!(
                    "Invalid SQLite connection string: {}",
                    e
                ))
            })?
            .read_only(true)
            .create_if_missing(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.timeout)
            .connect_with(options)
            .await
            .map_err(|e| {
                ExecutionError::DatabaseConnectionFailed(format!(
                    "Failed to open SQLite database: {}",
                    e
                ))
            })?;

        let rows = sqlx::query(query).fetch_all(&pool).await;
        pool.close().await;

        let rows = rows.map_err(|e| match ExecutionError::from(e) {
            ExecutionError::DatabaseQueryFailed(reason) => {
                ExecutionError::DatabaseQueryFailed(format!("SQLite query failed: {}", reason))
            }
            other => other,
        })?;

        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|column| column.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let data = rows
            .iter()
            .map(|row| (0..row.columns().len()).map(|i| cell_value(row, i)).collect())
            .collect();

        let result = ResultSet::new(columns, data);
        tracing::info!(row_count = result.row_count(), "SQLite query completed");
        Ok(result)
    }
}

/// SQLite values carry one of four storage classes
fn cell_value(row: &SqliteRow, i: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
        json!(v.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    } else {
        Value::Null
    }
}
