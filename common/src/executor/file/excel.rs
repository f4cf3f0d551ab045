// Excel report exporter

use super::write_report;
use crate::errors::ExecutionError;
use crate::executor::Exporter;
use crate::models::{ExportArtifact, ExportFormat, ResultSet};
use async_trait::async_trait;
use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};
use serde_json::Value;
use std::path::Path;
use tracing::{info, instrument};

const SHEET_NAME: &str = "Report";

/// Excel exporter: one worksheet, bold header row, typed cells
#[derive(Debug, Default, Clone)]
pub struct ExcelExporter;

impl ExcelExporter {
    pub fn new() -> Self {
        Self
    }

    /// Render the workbook in memory
    fn render(&self, data: &ResultSet) -> Result<Vec<u8>, XlsxError> {
        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(SHEET_NAME)?;

        let header = Format::new().set_bold();
        for (col, name) in data.columns.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, name, &header)?;
        }

        for (row_idx, row) in data.rows.iter().enumerate() {
            let row_num = row_idx as u32 + 1;
            for (col_idx, cell) in row.iter().enumerate() {
                write_cell(worksheet, row_num, col_idx as u16, cell)?;
            }
        }

        worksheet.autofit();
        workbook.save_to_buffer()
    }
}

fn write_cell(
    worksheet: &mut Worksheet,
    row: u32,
    col: u16,
    cell: &Value,
) -> Result<(), XlsxError> {
    match cell {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                worksheet.write_number(row, col, f)?;
            }
        }
        Value::String(s) => {
            worksheet.write_string(row, col, s)?;
        }
        Value::Bool(b) => {
            worksheet.write_boolean(row, col, *b)?;
        }
        Value::Null => {}
        other => {
            worksheet.write_string(row, col, other.to_string())?;
        }
    }
    Ok(())
}

#[async_trait]
impl Exporter for ExcelExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Excel
    }

    #[instrument(skip(self, data), fields(rows = data.row_count()))]
    async fn export(
        &self,
        data: &ResultSet,
        destination: &Path,
    ) -> Result<ExportArtifact, ExecutionError> {
        info!("Writing Excel report to: {}", destination.display());

        let buffer = self.render(data).map_err(|e| ExecutionError::ExportFailed {
            format: ExportFormat::Excel.to_string(),
            reason: format!("Failed to build workbook: {}", e),
        })?;

        write_report(destination, buffer, ExportFormat::Excel, data.row_count()).await
    }
}
