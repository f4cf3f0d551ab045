// Error handling framework

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Schedule calculation failed: {0}")]
    CalculationFailed(String),

    #[error("No next execution time available for {schedule_type} schedule")]
    NoNextExecution { schedule_type: String },
}

impl ScheduleError {
    /// True when the schedule configuration itself is unusable, as opposed to
    /// a transient arithmetic failure.
    pub fn is_invalid_config(&self) -> bool {
        !matches!(self, ScheduleError::CalculationFailed(_))
    }
}

/// Task store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Duplicate task id: {0}")]
    DuplicateId(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task catalog at {path} is corrupt: {reason}")]
    StorageCorruption { path: String, reason: String },

    #[error("Timed out after {waited_ms}ms waiting for catalog lock {path}")]
    LockTimeout { path: String, waited_ms: u64 },

    #[error("Catalog I/O failed: {0}")]
    Io(String),

    #[error("Catalog serialization failed: {0}")]
    Serialization(String),

    #[error("Rejected task with invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),
}

/// Task execution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Database connection failed: {0}")]
    DatabaseConnectionFailed(String),

    #[error("Database query failed: {0}")]
    DatabaseQueryFailed(String),

    #[error("Unsupported database type: {0}")]
    UnsupportedDatabase(String),

    #[error("Query returned no rows")]
    EmptyResult,

    #[error("Export to {format} failed: {reason}")]
    ExportFailed { format: String, reason: String },

    #[error("No exporter registered for format {0}")]
    ExporterUnavailable(String),

    #[error("Mail delivery failed: {0}")]
    MailFailed(String),

    #[error("Recipients configured but no mailer is available")]
    MailerUnavailable,

    #[error("Execution timed out after {0} seconds")]
    Timeout(u64),

    #[error("Execution cancelled by daemon shutdown")]
    Cancelled,

    #[error("Execution panicked: {0}")]
    Panicked(String),
}

/// Validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error(transparent)]
    InvalidSchedule(#[from] ScheduleError),
}

/// Daemon lifecycle errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Another scheduler ({holder}, pid {pid}) holds the catalog lease until {expires_at}")]
    LeaseHeld {
        holder: String,
        pid: u32,
        expires_at: String,
    },

    #[error("Lease operation failed: {0}")]
    Lease(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<sqlx::Error> for ExecutionError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(_)
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => ExecutionError::DatabaseConnectionFailed(err.to_string()),
            sqlx::Error::Database(db_err) => {
                ExecutionError::DatabaseQueryFailed(db_err.message().to_string())
            }
            _ => ExecutionError::DatabaseQueryFailed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "hour=25".to_string(),
            reason: "out of range".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
        assert!(err.is_invalid_config());
    }

    #[test]
    fn test_calculation_failure_is_not_config_error() {
        let err = ScheduleError::CalculationFailed("overflow".to_string());
        assert!(!err.is_invalid_config());
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout(300);
        assert!(err.to_string().contains("300 seconds"));
    }

    #[test]
    fn test_store_corruption_names_path() {
        let err = StoreError::StorageCorruption {
            path: "/tmp/tasks.json".to_string(),
            reason: "expected value at line 1".to_string(),
        };
        assert!(err.to_string().contains("/tmp/tasks.json"));
    }

    #[test]
    fn test_validation_wraps_schedule_error() {
        let err: ValidationError = ScheduleError::InvalidConfiguration("bad".to_string()).into();
        assert_eq!(err.to_string(), "Invalid schedule configuration: bad");
    }
}
