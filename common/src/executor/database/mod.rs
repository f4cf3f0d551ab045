// Database query source: dispatches a task's query by database type

mod postgresql;
mod sqlite;

use crate::errors::ExecutionError;
use crate::executor::QuerySource;
use crate::models::{QuerySpec, ResultSet};
use async_trait::async_trait;
use std::time::Duration;

pub use postgresql::PostgreSQLExecutor;
pub use sqlite::SqliteExecutor;

/// Database engines served by the built-in query source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    PostgreSQL,
    Sqlite,
}

impl DatabaseKind {
    /// Resolve a task's free-form `database_type`
    pub fn parse(database_type: &str) -> Option<Self> {
        match database_type.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Some(DatabaseKind::PostgreSQL),
            "sqlite" | "sqlite3" => Some(DatabaseKind::Sqlite),
            _ => None,
        }
    }
}

/// DatabaseQuerySource runs report queries against the configured engine
pub struct DatabaseQuerySource {
    postgres: PostgreSQLExecutor,
    sqlite: SqliteExecutor,
}

impl DatabaseQuerySource {
    /// Create a new DatabaseQuerySource with the specified connect timeout
    pub fn new(connect_timeout_seconds: u64) -> Self {
        let timeout = Duration::from_secs(connect_timeout_seconds);
        Self {
            postgres: PostgreSQLExecutor::new(timeout),
            sqlite: SqliteExecutor::new(timeout),
        }
    }
}

#[async_trait]
impl QuerySource for DatabaseQuerySource {
    #[tracing::instrument(skip(self, spec), fields(database_type = %spec.database_type))]
    async fn fetch(&self, spec: &QuerySpec) -> Result<ResultSet, ExecutionError> {
        match DatabaseKind::parse(&spec.database_type) {
            Some(DatabaseKind::PostgreSQL) => {
                self.postgres.fetch(&spec.database_url, &spec.query).await
            }
            Some(DatabaseKind::Sqlite) => self.sqlite.fetch(&spec.database_url, &spec.query).await,
            None => Err(ExecutionError::UnsupportedDatabase(
                spec.database_type.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_aliases() {
        assert_eq!(DatabaseKind::parse("postgresql"), Some(DatabaseKind::PostgreSQL));
        assert_eq!(DatabaseKind::parse("Postgres"), Some(DatabaseKind::PostgreSQL));
        assert_eq!(DatabaseKind::parse(" sqlite "), Some(DatabaseKind::Sqlite));
        assert_eq!(DatabaseKind::parse("mysql"), None);
    }

    #[tokio::test]
    async fn test_sqlite_tasks_routed_to_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let source = DatabaseQuerySource::new(1);
        let spec = QuerySpec {
            database_type: "sqlite".to_string(),
            database_url: format!("sqlite://{}", dir.path().join("missing.db").display()),
            query: "SELECT 1".to_string(),
        };
        assert!(matches!(
            source.fetch(&spec).await,
            Err(ExecutionError::DatabaseConnectionFailed(reason)) if reason.contains("SQLite")
        ));
    }

    #[tokio::test]
    async fn test_unsupported_database_rejected_before_connecting() {
        let source = DatabaseQuerySource::new(1);
        let spec = QuerySpec {
            database_type: "oracle".to_string(),
            database_url: "oracle://nowhere".to_string(),
            query: "SELECT 1 FROM dual".to_string(),
        };
        assert_eq!(
            source.fetch(&spec).await,
            Err(ExecutionError::UnsupportedDatabase("oracle".to_string()))
        );
    }

    #[tokio::test]
    async fn test_bad_connection_string_is_connection_failure() {
        let source = DatabaseQuerySource::new(1);
        let spec = QuerySpec {
            database_type: "postgresql".to_string(),
            database_url: "not a url".to_string(),
            query: "SELECT 1".to_string(),
        };
        assert!(matches!(
            source.fetch(&spec).await,
            Err(ExecutionError::DatabaseConnectionFailed(_))
        ));
    }
}
