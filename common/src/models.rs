use crate::errors::{ScheduleError, ValidationError};
use crate::schedule::{Schedule, ScheduleConfig, ScheduleTrigger, ScheduleType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_SUBJECT: &str = "Scheduled Database Report";

fn default_true() -> bool {
    true
}

fn default_subject() -> String {
    DEFAULT_SUBJECT.to_string()
}

fn default_database_type() -> String {
    "postgresql".to_string()
}

// ============================================================================
// Task Catalog
// ============================================================================

/// QuerySpec is handed verbatim to the query source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(default = "default_database_type")]
    pub database_type: String,
    pub database_url: String,
    pub query: String,
}

/// NotificationSpec describes which reports to render and who receives them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSpec {
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub cc_recipients: Vec<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_true")]
    pub export_excel: bool,
    #[serde(default)]
    pub export_csv: bool,
    #[serde(default)]
    pub export_pdf: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excel_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_path: Option<PathBuf>,
}

impl Default for NotificationSpec {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            cc_recipients: Vec::new(),
            subject: default_subject(),
            export_excel: true,
            export_csv: false,
            export_pdf: false,
            excel_path: None,
            csv_path: None,
            pdf_path: None,
        }
    }
}

impl NotificationSpec {
    /// Formats requested for this task, in rendering order
    pub fn requested_formats(&self) -> Vec<ExportFormat> {
        [
            (self.export_excel, ExportFormat::Excel),
            (self.export_csv, ExportFormat::Csv),
            (self.export_pdf, ExportFormat::Pdf),
        ]
        .into_iter()
        .filter_map(|(wanted, format)| wanted.then_some(format))
        .collect()
    }

    pub fn path_override(&self, format: ExportFormat) -> Option<&Path> {
        match format {
            ExportFormat::Excel => self.excel_path.as_deref(),
            ExportFormat::Csv => self.csv_path.as_deref(),
            ExportFormat::Pdf => self.pdf_path.as_deref(),
        }
    }
}

/// TaskEntry is one persisted report job together with its run history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub query_spec: QuerySpec,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub schedule_config: ScheduleConfig,
    #[serde(default)]
    pub notification_spec: NotificationSpec,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// NewTask is the caller-supplied part of a task before it enters the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub query_spec: QuerySpec,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub schedule_config: ScheduleConfig,
    #[serde(default)]
    pub notification_spec: NotificationSpec,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl TaskEntry {
    /// Validate a draft and turn it into a fresh catalog entry.
    ///
    /// The schedule is parsed here so that an unusable configuration never
    /// reaches the store.
    pub fn create(draft: NewTask, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        validate_draft(&draft)?;
        Schedule::from_config(draft.schedule_type, &draft.schedule_config)?;

        let mut entry = Self {
            id: Uuid::new_v4().to_string(),
            name: draft.name.trim().to_string(),
            description: draft.description,
            query_spec: draft.query_spec,
            schedule_type: draft.schedule_type,
            schedule_config: draft.schedule_config,
            notification_spec: draft.notification_spec,
            is_active: draft.is_active,
            created_at: now,
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
            error_count: 0,
            last_error: None,
        };
        entry.recompute_next_run();
        Ok(entry)
    }

    pub fn schedule(&self) -> Result<Schedule, ScheduleError> {
        Schedule::from_config(self.schedule_type, &self.schedule_config)
    }

    /// Later of creation time and last completed run
    pub fn reference_time(&self) -> DateTime<Utc> {
        match self.last_run_at {
            Some(last) if last > self.created_at => last,
            _ => self.created_at,
        }
    }

    /// Pure next fire derived from the schedule and reference time
    pub fn expected_next_run(&self) -> Option<DateTime<Utc>> {
        self.schedule()
            .ok()
            .and_then(|schedule| schedule.next_fire_after(self.reference_time()).ok())
            .flatten()
    }

    pub fn recompute_next_run(&mut self) {
        self.next_run_at = self.expected_next_run();
    }

    /// Record a completed attempt that was fired for `fired_at`
    pub fn apply_outcome(&mut self, fired_at: DateTime<Utc>, outcome: &Outcome) {
        self.last_run_at = Some(match self.last_run_at {
            Some(previous) if previous > fired_at => previous,
            _ => fired_at,
        });
        self.run_count += 1;
        if let Outcome::Failure(reason) = outcome {
            self.error_count += 1;
            self.last_error = Some(reason.clone());
        }
        self.recompute_next_run();
    }
}

fn validate_draft(draft: &NewTask) -> Result<(), ValidationError> {
    if draft.name.trim().is_empty() {
        return Err(ValidationError::MissingField("name".to_string()));
    }
    if draft.query_spec.query.trim().is_empty() {
        return Err(ValidationError::MissingField("query_spec.query".to_string()));
    }
    if draft.query_spec.database_url.trim().is_empty() {
        return Err(ValidationError::MissingField(
            "query_spec.database_url".to_string(),
        ));
    }

    let notification = &draft.notification_spec;
    for (field, addresses) in [
        ("notification_spec.recipients", &notification.recipients),
        ("notification_spec.cc_recipients", &notification.cc_recipients),
    ] {
        if let Some(bad) = addresses.iter().find(|addr| !addr.contains('@')) {
            return Err(ValidationError::InvalidFieldValue {
                field: field.to_string(),
                reason: format!("'{}' is not an email address", bad),
            });
        }
    }
    Ok(())
}

// ============================================================================
// Execution Models
// ============================================================================

/// Outcome of one completed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Success { rows: usize },
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success { rows } => write!(f, "success ({} rows)", rows),
            Outcome::Failure(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// ResultSet carries tabular query output between collaborators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// ExportFormat selects an exporter capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Excel,
    Csv,
    Pdf,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Excel => "xlsx",
            ExportFormat::Csv => "csv",
            ExportFormat::Pdf => "pdf",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Excel => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            ExportFormat::Csv => "text/csv",
            ExportFormat::Pdf => "application/pdf",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Excel => write!(f, "excel"),
            ExportFormat::Csv => write!(f, "csv"),
            ExportFormat::Pdf => write!(f, "pdf"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "excel" | "xlsx" => Ok(ExportFormat::Excel),
            "csv" => Ok(ExportFormat::Csv),
            "pdf" => Ok(ExportFormat::Pdf),
            _ => Err(format!("Invalid export format: {}", s)),
        }
    }
}

/// ExportArtifact describes a rendered report file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub format: ExportFormat,
    pub mime_type: String,
    pub size: u64,
    pub row_count: usize,
    pub created_at: DateTime<Utc>,
}

/// MailMessage is what the runner hands to the mailer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<ExportArtifact>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn draft(schedule_type: ScheduleType, config: Value) -> NewTask {
        NewTask {
            name: "Daily sales".to_string(),
            description: String::new(),
            query_spec: QuerySpec {
                database_type: "postgresql".to_string(),
                database_url: "postgresql://localhost/sales".to_string(),
                query: "SELECT 1".to_string(),
            },
            schedule_type,
            schedule_config: config.as_object().cloned().unwrap(),
            notification_spec: NotificationSpec {
                recipients: vec!["ops@example.com".to_string()],
                ..NotificationSpec::default()
            },
            is_active: true,
        }
    }

    #[test]
    fn test_create_computes_first_fire() {
        let entry = TaskEntry::create(
            draft(ScheduleType::Interval, json!({"minutes": 1})),
            at("2024-01-01T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(entry.next_run_at, Some(at("2024-01-01T00:01:00Z")));
        assert_eq!(entry.run_count, 0);
        assert!(Uuid::parse_str(&entry.id).is_ok());
    }

    #[test]
    fn test_create_rejects_invalid_schedule() {
        let err = TaskEntry::create(
            draft(ScheduleType::Cron, json!({"minute": 61})),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSchedule(_)));
    }

    #[test]
    fn test_create_rejects_bad_recipient() {
        let mut task = draft(ScheduleType::Interval, json!({"hours": 1}));
        task.notification_spec.cc_recipients = vec!["not-an-address".to_string()];
        let err = TaskEntry::create(task, Utc::now()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFieldValue { .. }));
    }

    #[test]
    fn test_apply_success_keeps_last_error() {
        let created = at("2024-01-01T00:00:00Z");
        let mut entry = TaskEntry::create(
            draft(ScheduleType::Interval, json!({"minutes": 1})),
            created,
        )
        .unwrap();

        entry.apply_outcome(
            created + Duration::minutes(1),
            &Outcome::Failure("connection refused".to_string()),
        );
        entry.apply_outcome(created + Duration::minutes(2), &Outcome::Success { rows: 3 });

        assert_eq!(entry.run_count, 2);
        assert_eq!(entry.error_count, 1);
        assert_eq!(entry.last_error.as_deref(), Some("connection refused"));
        assert_eq!(entry.next_run_at, Some(at("2024-01-01T00:03:00Z")));
    }

    #[test]
    fn test_once_entry_is_exhausted_after_run() {
        let created = at("2024-01-01T00:00:00Z");
        let mut entry = TaskEntry::create(
            draft(
                ScheduleType::Once,
                json!({"run_date": "2024-01-01T06:00:00Z"}),
            ),
            created,
        )
        .unwrap();
        assert_eq!(entry.next_run_at, Some(at("2024-01-01T06:00:00Z")));

        entry.apply_outcome(at("2024-01-01T06:00:00Z"), &Outcome::Success { rows: 1 });
        assert_eq!(entry.next_run_at, None);
    }

    #[test]
    fn test_stored_record_fills_defaults() {
        let record = json!({
            "id": "legacy-1",
            "name": "Legacy",
            "query_spec": {"database_url": "postgresql://db/x", "query": "SELECT 1"},
            "schedule_type": "interval",
            "schedule_config": {"hours": 6},
            "created_at": "2024-01-01T00:00:00Z"
        });
        let entry: TaskEntry = serde_json::from_value(record).unwrap();
        assert!(entry.is_active);
        assert_eq!(entry.query_spec.database_type, "postgresql");
        assert_eq!(entry.notification_spec.subject, DEFAULT_SUBJECT);
        assert_eq!(entry.notification_spec.requested_formats(), vec![ExportFormat::Excel]);
    }

    #[test]
    fn test_outcome_serialization() {
        let value = serde_json::to_value(Outcome::Failure("boom".to_string())).unwrap();
        assert_eq!(value, json!({"status": "failure", "detail": "boom"}));
    }
}
