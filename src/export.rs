//! CSV export of result rows

use crate::db::Row;
use crate::error::{QueryError, Result};
use serde_json::Value;
use std::io::Write;

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Write `rows` as CSV with a header line of `columns`, in column order.
pub fn write_csv<W: Write>(writer: W, rows: &[Row], columns: &[String]) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new().terminator(csv::Terminator::Any(b'\n')).from_writer(writer);
    wtr.write_record(columns)?;
    for row in rows {
        wtr.write_record(columns.iter().map(|col| cell_text(row.get(col))))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn to_csv_string(rows: &[Row], columns: &[String]) -> Result<String> {
    let mut buf = Vec::new();
    write_csv(&mut buf, rows, columns)?;
    String::from_utf8(buf).map_err(|e| QueryError::Csv(e.to_string()))
}
