// Executor module: boundaries to the query, export and mail collaborators
// plus the built-in implementations wired by the binaries

pub mod database;
pub mod file;
pub mod mail;

use crate::errors::ExecutionError;
use crate::models::{ExportArtifact, ExportFormat, MailMessage, QuerySpec, ResultSet};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub use database::{DatabaseKind, DatabaseQuerySource, PostgreSQLExecutor, SqliteExecutor};
pub use file::{CsvExporter, ExcelExporter};
pub use mail::OutboxMailer;

/// QuerySource runs a task's query and returns the tabular result
#[async_trait]
pub trait QuerySource: Send + Sync {
    async fn fetch(&self, spec: &QuerySpec) -> Result<ResultSet, ExecutionError>;
}

/// Exporter renders a result set into one report format
#[async_trait]
pub trait Exporter: Send + Sync {
    fn format(&self) -> ExportFormat;

    async fn export(
        &self,
        data: &ResultSet,
        destination: &Path,
    ) -> Result<ExportArtifact, ExecutionError>;
}

/// Mailer delivers a finished report
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), ExecutionError>;
}

/// Exporters keyed by the format they produce
#[derive(Clone, Default)]
pub struct ExporterRegistry {
    exporters: HashMap<ExportFormat, Arc<dyn Exporter>>,
}

impl ExporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exporter, replacing any previous one for the same format
    pub fn register(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporters.insert(exporter.format(), exporter);
        self
    }

    pub fn get(&self, format: ExportFormat) -> Option<Arc<dyn Exporter>> {
        self.exporters.get(&format).cloned()
    }

    pub fn formats(&self) -> Vec<ExportFormat> {
        self.exporters.keys().copied().collect()
    }
}
