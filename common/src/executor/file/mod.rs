// Report file exporters (Excel, CSV)

mod csv;
mod excel;

use crate::errors::ExecutionError;
use crate::models::{ExportArtifact, ExportFormat};
use crate::storage::write_atomic;
use chrono::Utc;
use std::path::{Path, PathBuf};

pub use csv::CsvExporter;
pub use excel::ExcelExporter;

/// Persist rendered report bytes and describe the resulting file
async fn write_report(
    destination: &Path,
    bytes: Vec<u8>,
    format: ExportFormat,
    row_count: usize,
) -> Result<ExportArtifact, ExecutionError> {
    let path: PathBuf = destination.to_path_buf();
    let size = bytes.len() as u64;

    let target = path.clone();
    tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
        .await
        .map_err(|e| ExecutionError::ExportFailed {
            format: format.to_string(),
            reason: format!("writer task failed: {}", e),
        })?
        .map_err(|e| ExecutionError::ExportFailed {
            format: format.to_string(),
            reason: format!("Failed to write {}: {}", path.display(), e),
        })?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("report.{}", format.extension()));

    Ok(ExportArtifact {
        path,
        file_name,
        format,
        mime_type: format.mime_type().to_string(),
        size,
        row_count,
        created_at: Utc::now(),
    })
}

/// Cell text used by formats without native types
fn cell_text(cell: &serde_json::Value) -> String {
    match cell {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
