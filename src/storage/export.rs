//! CSV export of the anomaly history.

use std::io::Write;

use chrono::SecondsFormat;

use super::AnomalyRecord;

/// Column header, matching the stored record fields.
pub const CSV_HEADER: &str = "id,timestamp,source_address,packet_size,response_time,status,explanation";

/// Write `records` as CSV. Returns the number of data rows written.
pub fn write_csv<W: Write>(out: &mut W, records: &[AnomalyRecord]) -> std::io::Result<usize> {
    writeln!(out, "{CSV_HEADER}")?;
    for r in records {
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            r.id,
            r.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            quote(&r.source_address),
            r.packet_size,
            r.response_time,
            r.status,
            quote(&r.explanation),
        )?;
    }
    Ok(records.len())
}

/// Render `records` to an in-memory CSV document.
pub fn to_csv_string(records: &[AnomalyRecord]) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write_csv(&mut buf, records);
    String::from_utf8_lossy(&buf).into_owned()
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}
