// CSV report exporter

use super::{cell_text, write_report};
use crate::errors::ExecutionError;
use crate::executor::Exporter;
use crate::models::{ExportArtifact, ExportFormat, ResultSet};
use async_trait::async_trait;
use csv::WriterBuilder;
use std::path::Path;
use tracing::{info, instrument};

/// CSV exporter
#[derive(Debug, Clone)]
pub struct CsvExporter {
    delimiter: u8,
}

impl Default for CsvExporter {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl CsvExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(delimiter: char) -> Self {
        Self {
            delimiter: delimiter as u8,
        }
    }

    fn render(&self, data: &ResultSet) -> Result<Vec<u8>, csv::Error> {
        let mut writer = WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(Vec::new());

        writer.write_record(&data.columns)?;
        for row in &data.rows {
            writer.write_record(row.iter().map(cell_text))?;
        }

        writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }
}

#[async_trait]
impl Exporter for CsvExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    #[instrument(skip(self, data), fields(rows = data.row_count()))]
    async fn export(
        &self,
        data: &ResultSet,
        destination: &Path,
    ) -> Result<ExportArtifact, ExecutionError> {
        info!(
            "Writing CSV report to: {} with delimiter: {:?}",
            destination.display(),
            self.delimiter as char
        );

        let buffer = self.render(data).map_err(|e| ExecutionError::ExportFailed {
            format: ExportFormat::Csv.to_string(),
            reason: format!("Failed to write CSV record: {}", e),
        })?;

        write_report(destination, buffer, ExportFormat::Csv, data.row_count()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_writes_header_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("report.csv");
        let data = ResultSet::new(
            vec!["name".to_string(), "amount".to_string(), "note".to_string()],
            vec![
                vec![json!("widget, large"), json!(3), Value::Null],
                vec![json!("gadget"), json!(1.5), json!(false)],
            ],
        );

        let artifact = CsvExporter::new().export(&data, &destination).await.unwrap();
        assert_eq!(artifact.mime_type, "text/csv");

        let written = std::fs::read_to_string(&destination).unwrap();
        assert_eq!(
            written,
            "name,amount,note\n\"widget, large\",3,\ngadget,1.5,false\n"
        );
    }

    #[tokio::test]
    async fn test_custom_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("report.csv");
        let data = ResultSet::new(vec!["a".to_string(), "b".to_string()], vec![vec![json!(1), json!(2)]]);

        CsvExporter::with_delimiter(';')
            .export(&data, &destination)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "a;b\n1;2\n");
    }
}
