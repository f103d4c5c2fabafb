use rust_xlsxwriter::{Format, Workbook};

use crate::errors::ExportError;
use crate::extractor::ResultRow;
use crate::locale::ExtractionMode;

// Excel refuses longer cell strings.
const XLSX_MAX_CELL_CHARS: usize = 32_767;

pub const CSV_MIME: &str = "text/csv; charset=utf-8";
pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub fn file_name(mode: ExtractionMode, extension: &str) -> String {
    format!("serp_{}_{}.{}", mode, chrono::Local::now().format("%Y%m%d_%H%M%S"), extension)
}

/// UTF-8 CSV with the mode's fixed header and one record per row.
pub fn to_csv(mode: ExtractionMode, rows: &[ResultRow]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(mode.columns())?;
    for row in rows {
        writer.write_record(row.values())?;
    }
    Ok(writer.into_inner().map_err(|e| e.into_error())?)
}

fn cell_text(value: &str) -> &str {
    match value.char_indices().nth(XLSX_MAX_CELL_CHARS) {
        Some((cut, _)) => &value[..cut],
        None => value,
    }
}

/// Single-sheet workbook with the same columns and rows as the CSV.
pub fn to_spreadsheet(mode: ExtractionMode, rows: &[ResultRow]) -> Result<Vec<u8>, ExportError> {
    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Results")?;

    for (col, name) in mode.columns().iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *name, &header)?;
        let width = if *name == "URL" || *name == "Content" || *name == "Answer" { 80.0 } else { 40.0 };
        sheet.set_column_width(col as u16, width)?;
    }
    sheet.set_freeze_panes(1, 0)?;

    for (i, row) in rows.iter().enumerate() {
        for (col, value) in row.values().into_iter().enumerate() {
            sheet.write_string(i as u32 + 1, col as u16, cell_text(value))?;
        }
    }

    Ok(workbook.save_to_buffer()?)
}
