// PostgreSQL query executor

use crate::errors::ExecutionError;
use crate::models::ResultSet;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use std::collections::BTreeSet;
use std::time::Duration;

/// PostgreSQL query executor
pub struct PostgreSQLExecutor {
    timeout: Duration,
}

impl PostgreSQLExecutor {
    /// Create a new PostgreSQL executor
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Open a single-connection pool, run the query and close the pool again
    #[tracing::instrument(
        skip(self, connection_string, query),
        fields(database_type = "postgresql")
    )]
    pub async fn fetch(
        &self,
        connection_string: &str,
        query: &str,
    ) -> Result<ResultSet, ExecutionError> {
        tracing::debug!("Connecting to PostgreSQL database");

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.timeout)
            .connect(connection_string)
            .await
            .map_err(|e| {
                ExecutionError::DatabaseConnectionFailed(format!(
                    "Failed to connect to PostgreSQL: {}",
                    e
                ))
            })?;

        let rows = sqlx::query(query).fetch_all(&pool).await;
        pool.close().await;

        let rows = rows.map_err(|e| match ExecutionError::from(e) {
            ExecutionError::DatabaseQueryFailed(reason) => {
                ExecutionError::DatabaseQueryFailed(format!("PostgreSQL query failed: {}", reason))
            }
            other => other,
        })?;

        let result = rows_to_result_set(&rows);
        tracing::info!(row_count = result.row_count(), "PostgreSQL query completed");
        Ok(result)
    }
}

fn rows_to_result_set(rows: &[PgRow]) -> ResultSet {
    let columns = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect()
        })
        .unwrap_or_default();

    let mut undecodable = BTreeSet::new();
    let data = rows
        .iter()
        .map(|row| {
            (0..row.columns().len())
                .map(|i| {
                    cell_value(row, i).unwrap_or_else(|| {
                        undecodable.insert(i);
                        Value::Null
                    })
                })
                .collect()
        })
        .collect();

    if let Some(row) = rows.first() {
        for i in undecodable {
            let column = &row.columns()[i];
            tracing::warn!(
                column = column.name(),
                column_type = column.type_info().name(),
                "Unsupported PostgreSQL column type, exporting empty cells"
            );
        }
    }

    ResultSet::new(columns, data)
}

/// Decode one cell into JSON, trying the common PostgreSQL types in turn.
///
/// `None` means no decoder matched the column type.
fn cell_value(row: &PgRow, i: usize) -> Option<Value> {
    let value = if let Ok(v) = row.try_get::<Option<String>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<i16>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<i32>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<f32>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<Decimal>, _>(i) {
        v.map(decimal_value).unwrap_or(Value::Null)
    } else if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(i) {
        json!(v.map(|d| d.to_string()))
    } else if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(i) {
        json!(v.map(|dt| dt.to_string()))
    } else if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i) {
        json!(v.map(|dt| dt.to_rfc3339()))
    } else if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(i) {
        json!(v.map(|t| t.to_string()))
    } else if let Ok(v) = row.try_get::<Option<PgInterval>, _>(i) {
        json!(v.map(|interval| format_interval(&interval)))
    } else if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(i) {
        json!(v.map(|id| id.to_string()))
    } else if let Ok(v) = row.try_get::<Option<Value>, _>(i) {
        v.unwrap_or(Value::Null)
    } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
        json!(v.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    } else if let Ok(v) = row.try_get::<Option<Vec<String>>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<Vec<i32>>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<Vec<i64>>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<Vec<f64>>, _>(i) {
        json!(v)
    } else if let Ok(v) = row.try_get::<Option<Vec<Decimal>>, _>(i) {
        json!(v.map(|items| items.into_iter().map(decimal_value).collect::<Vec<_>>()))
    } else if let Ok(v) = row.try_get::<Option<Vec<chrono::DateTime<chrono::Utc>>>, _>(i) {
        json!(v.map(|items| items.iter().map(|dt| dt.to_rfc3339()).collect::<Vec<_>>()))
    } else {
        return None;
    };
    Some(value)
}

/// Exact decimals become JSON numbers when they fit an f64 losslessly
/// enough for a spreadsheet, otherwise their text form
fn decimal_value(decimal: Decimal) -> Value {
    match decimal.to_f64() {
        Some(float) if float.is_finite() => json!(float),
        _ => json!(decimal.to_string()),
    }
}

fn format_interval(interval: &PgInterval) -> String {
    let mut parts = Vec::new();
    if interval.months != 0 {
        parts.push(format!("{} mons", interval.months));
    }
    if interval.days != 0 {
        parts.push(format!("{} days", interval.days));
    }
    let micros = interval.microseconds;
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let total = micros.unsigned_abs();
        let seconds = total / 1_000_000;
        let fraction = total % 1_000_000;
        let clock = format!(
            "{}{:02}:{:02}:{:02}",
            sign,
            seconds / 3600,
            (seconds / 60) % 60,
            seconds % 60
        );
        if fraction == 0 {
            parts.push(clock);
        } else {
            parts.push(format!("{}.{:06}", clock, fraction));
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_decimal_becomes_number() {
        let revenue = Decimal::from_str("1520.75").unwrap();
        assert_eq!(decimal_value(revenue), json!(1520.75));
        assert_eq!(decimal_value(Decimal::ZERO), json!(0.0));
    }

    #[test]
    fn test_interval_formatting() {
        let interval = PgInterval {
            months: 1,
            days: 2,
            microseconds: 3_723_000_000,
        };
        assert_eq!(format_interval(&interval), "1 mons 2 days 01:02:03");

        let short = PgInterval {
            months: 0,
            days: 0,
            microseconds: -1_500_000,
        };
        assert_eq!(format_interval(&short), "-00:00:01.500000");

        let zero = PgInterval {
            months: 0,
            days: 0,
            microseconds: 0,
        };
        assert_eq!(format_interval(&zero), "00:00:00");
    }
}
