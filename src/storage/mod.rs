//! SQLite storage layer -- the append-only anomaly store.

pub mod export;
pub mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Row, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::detect::{Label, Verdict};
use crate::features::Flow;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open anomaly store: {0}")]
    Open(#[source] anyhow::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("failed to persist anomaly: {0}")]
    WriteFailure(#[source] rusqlite::Error),
    #[error("anomaly query failed: {0}")]
    Query(#[source] rusqlite::Error),
    #[error("store task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> anyhow::Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    // synchronous = FULL: an acknowledged append is on disk, not only in the WAL buffer.
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// A scored flow that came back Anomaly, waiting for its explanation.
///
/// Only [`AnomalyCandidate::from_verdict`] builds one, so a Normal decision can
/// never reach the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyCandidate {
    source_address: String,
    packet_size: f64,
    response_time: f64,
    score: f64,
}

impl AnomalyCandidate {
    /// `None` unless the verdict is Anomaly.
    pub fn from_verdict(flow: &Flow, verdict: Verdict) -> Option<Self> {
        if !verdict.is_anomaly() {
            return None;
        }
        Some(Self {
            source_address: flow.source_address(),
            packet_size: flow.features.get("packet_size").unwrap_or_default(),
            response_time: flow.features.get("response_time").unwrap_or_default(),
            score: verdict.score,
        })
    }

    pub fn source_address(&self) -> &str {
        &self.source_address
    }

    pub fn packet_size(&self) -> f64 {
        self.packet_size
    }

    pub fn response_time(&self) -> f64 {
        self.response_time
    }

    pub fn score(&self) -> f64 {
        self.score
    }
}

/// One persisted anomaly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub source_address: String,
    pub packet_size: f64,
    pub response_time: f64,
    pub status: Label,
    pub explanation: String,
}

const SELECT_RECORDS: &str = "SELECT id, timestamp, source_address, packet_size, response_time, status, explanation
     FROM anomalies";

impl AnomalyRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let ts: String = row.get(1)?;
        let status: String = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            timestamp: parse_timestamp(&ts)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, e.into()))?,
            source_address: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            packet_size: row.get(3)?,
            response_time: row.get(4)?,
            status: status
                .parse()
                .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?,
            explanation: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        })
    }
}

/// RFC 3339, or the `YYYY-MM-DD HH:MM:SS` form older rows carry.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|n| n.and_utc()))
}

/// Durable, append-only record of detected anomalies.
///
/// Cloning is cheap; clones share the pool and the append lock.
#[derive(Clone)]
pub struct AnomalyStore {
    pool: Pool,
    append_lock: Arc<Mutex<()>>,
}

impl AnomalyStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open the database at `path`, creating the schema when needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        open_pool(path).map(Self::new).map_err(StoreError::Open)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Assign id and timestamp, commit, and return the stored record.
    ///
    /// Appends are serialized so ids and timestamps both increase in commit order.
    pub fn append(&self, candidate: &AnomalyCandidate, explanation: &str) -> Result<AnomalyRecord, StoreError> {
        let _guard = self.append_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut conn = self.pool.get()?;

        // Stored at microsecond precision; truncate so the returned record matches a re-read.
        let timestamp = Utc::now().trunc_subsecs(6);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::WriteFailure)?;
        tx.execute(
            "INSERT INTO anomalies (timestamp, source_address, packet_size, response_time, status, explanation)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                candidate.source_address,
                candidate.packet_size,
                candidate.response_time,
                Label::Anomaly.as_str(),
                explanation,
            ],
        )
        .map_err(StoreError::WriteFailure)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(StoreError::WriteFailure)?;

        debug!(id, source = %candidate.source_address, "anomaly persisted");

        Ok(AnomalyRecord {
            id,
            timestamp,
            source_address: candidate.source_address.clone(),
            packet_size: candidate.packet_size,
            response_time: candidate.response_time,
            status: Label::Anomaly,
            explanation: explanation.to_string(),
        })
    }

    /// Up to `limit` records, most recent first.
    pub fn recent_history(&self, limit: usize) -> Result<Vec<AnomalyRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query(&format!("{SELECT_RECORDS} ORDER BY id DESC LIMIT ?1"), params![limit])
    }

    /// Full history, most recent first.
    pub fn all(&self) -> Result<Vec<AnomalyRecord>, StoreError> {
        self.query(&format!("{SELECT_RECORDS} ORDER BY id DESC"), params![])
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM anomalies", [], |row| row.get(0))
            .map_err(StoreError::Query)?;
        Ok(n as usize)
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<AnomalyRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql).map_err(StoreError::Query)?;
        let rows = stmt
            .query_map(params, AnomalyRecord::from_row)
            .map_err(StoreError::Query)?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r.map_err(StoreError::Query)?);
        }
        Ok(records)
    }
}
