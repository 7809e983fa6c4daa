//! Database schema and migrations.

use anyhow::Result;
use chrono::SecondsFormat;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Row};
use tracing::{info, warn};

use super::parse_timestamp;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

const ANOMALIES_TABLE: &str = "CREATE TABLE IF NOT EXISTS anomalies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    source_address TEXT NOT NULL DEFAULT '',
    packet_size REAL NOT NULL,
    response_time REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'Anomaly' CHECK (status = 'Anomaly'),
    explanation TEXT NOT NULL
);";

/// Run all pending migrations. Safe to call on every startup.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    // An `anomalies` table without a recorded version was written by the earlier
    // dashboard: loose column types, NULLs allowed, address column named `ip_address`.
    let versioned: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM schema_version WHERE version = ?1)",
        [SCHEMA_VERSION],
        |row| row.get(0),
    )?;
    if !versioned && has_table(conn, "anomalies")? {
        rebuild_legacy(conn)?;
    }

    conn.execute_batch(ANOMALIES_TABLE)?;
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_anomalies_timestamp ON anomalies(timestamp);")?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

/// A legacy row that fits the strict schema.
struct LegacyRow {
    id: i64,
    timestamp: String,
    source_address: String,
    packet_size: f64,
    response_time: f64,
    explanation: String,
}

impl LegacyRow {
    /// `None` when the row cannot be represented as an anomaly record.
    fn decode(row: &Row<'_>) -> rusqlite::Result<Option<Self>> {
        let id: i64 = row.get(0)?;
        let timestamp = match row.get_ref(1)? {
            ValueRef::Text(t) => std::str::from_utf8(t)
                .ok()
                .and_then(|s| parse_timestamp(s).ok())
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
            _ => None,
        };
        let packet_size = measurement(row.get_ref(3)?);
        let response_time = measurement(row.get_ref(4)?);
        let status_ok = match row.get_ref(5)? {
            ValueRef::Null => true,
            ValueRef::Text(t) => t == b"Anomaly",
            _ => false,
        };

        let (Some(timestamp), Some(packet_size), Some(response_time), true) =
            (timestamp, packet_size, response_time, status_ok)
        else {
            return Ok(None);
        };

        Ok(Some(Self {
            id,
            timestamp,
            source_address: text_or_empty(row.get_ref(2)?),
            packet_size,
            response_time,
            explanation: text_or_empty(row.get_ref(6)?),
        }))
    }
}

/// Numeric cell, or numeric text, that is finite and non-negative.
fn measurement(value: ValueRef<'_>) -> Option<f64> {
    let x = match value {
        ValueRef::Real(f) => f,
        ValueRef::Integer(i) => i as f64,
        ValueRef::Text(t) => std::str::from_utf8(t).ok()?.trim().parse().ok()?,
        _ => return None,
    };
    (x.is_finite() && x >= 0.0).then_some(x)
}

fn text_or_empty(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        _ => String::new(),
    }
}

/// Copy a legacy table into the strict schema. Rows that do not decode are
/// skipped with a warning; ids of kept rows are preserved.
fn rebuild_legacy(conn: &Connection) -> Result<()> {
    let address = if has_column(conn, "anomalies", "source_address")? {
        "source_address"
    } else if has_column(conn, "anomalies", "ip_address")? {
        "ip_address"
    } else {
        "NULL"
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch("ALTER TABLE anomalies RENAME TO anomalies_legacy;")?;
    tx.execute_batch(ANOMALIES_TABLE)?;

    let (mut kept, mut skipped) = (0usize, 0usize);
    {
        let mut select = tx.prepare(&format!(
            "SELECT id, timestamp, {address}, packet_size, response_time, status, explanation
             FROM anomalies_legacy ORDER BY id"
        ))?;
        let mut insert = tx.prepare(
            "INSERT INTO anomalies (id, timestamp, source_address, packet_size, response_time, status, explanation)
             VALUES (?1, ?2, ?3, ?4, ?5, 'Anomaly', ?6)",
        )?;

        let mut rows = select.query([])?;
        while let Some(row) = rows.next()? {
            match LegacyRow::decode(row)? {
                Some(r) => {
                    insert.execute(params![
                        r.id,
                        r.timestamp,
                        r.source_address,
                        r.packet_size,
                        r.response_time,
                        r.explanation
                    ])?;
                    kept += 1;
                }
                None => {
                    skipped += 1;
                    let id: Option<i64> = row.get(0).ok();
                    warn!(?id, "skipping legacy anomaly row that does not fit the schema");
                }
            }
        }
    }

    tx.execute_batch("DROP TABLE anomalies_legacy;")?;
    tx.commit()?;
    info!(kept, skipped, "migrated legacy anomaly table");
    Ok(())
}

fn has_table(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
