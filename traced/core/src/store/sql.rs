//! Row shapes and statements shared by the SQL backends.
//!
//! Both engines store timestamps as nanosecond `BIGINT`s, run ids as their
//! hyphenated text and snapshots as JSON text.

use std::collections::BTreeMap;

use traced_proto::prelude::{
    Outcome, Run, RunFilter, RunId, RunStatus, RunSummary, Snapshot, Span, SpanId, Timestamp,
};

use super::StoreError;

/// Statements of one SQL engine.
#[derive(Debug)]
pub(crate) struct Dialect {
    pub schema: &'static [&'static str],
    pub upsert_run: &'static str,
    pub insert_span: &'static str,
    pub select_run: &'static str,
    pub select_spans: &'static str,
    /// Summary select ending in `WHERE 1=1`, so filters can be appended.
    pub select_summaries: &'static str,
    pub group_summaries: &'static str,
    pub delete_spans: &'static str,
    pub delete_run: &'static str,
}

#[cfg(test)]
const SPAN_COLUMNS: &str = "run_id, id, seq, parent_id, name, thread_id, started_at, ended_at, \
                            args_snapshot, result_snapshot, error, sampled";

pub(crate) const POSTGRES: Dialect = Dialect {
    schema: &[
        "CREATE TABLE IF NOT EXISTS runs (
            id VARCHAR(36) PRIMARY KEY,
            name TEXT NOT NULL,
            status VARCHAR(16) NOT NULL,
            started_at BIGINT NOT NULL,
            ended_at BIGINT,
            metadata TEXT NOT NULL,
            version BIGINT NOT NULL DEFAULT 1,
            tags TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS spans (
            run_id VARCHAR(36) NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            id BIGINT NOT NULL,
            seq BIGINT NOT NULL,
            parent_id BIGINT,
            name TEXT NOT NULL,
            thread_id BIGINT NOT NULL,
            started_at BIGINT NOT NULL,
            ended_at BIGINT NOT NULL,
            args_snapshot TEXT NOT NULL,
            result_snapshot TEXT,
            error TEXT,
            sampled BOOLEAN NOT NULL,
            PRIMARY KEY (run_id, id)
        )",
        "CREATE INDEX IF NOT EXISTS spans_run_seq ON spans (run_id, seq)",
    ],
    upsert_run: "INSERT INTO runs (id, name, status, started_at, ended_at, metadata, version, tags)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            status = EXCLUDED.status,
            ended_at = EXCLUDED.ended_at,
            metadata = EXCLUDED.metadata,
            tags = EXCLUDED.tags
        WHERE runs.status = 'active'",
    insert_span: "INSERT INTO spans (run_id, id, seq, parent_id, name, thread_id, started_at, \
        ended_at, args_snapshot, result_snapshot, error, sampled)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (run_id, id) DO NOTHING",
    select_run: "SELECT id, name, status, started_at, ended_at, metadata, version, tags FROM runs WHERE id = $1",
    select_spans: "SELECT run_id, id, seq, parent_id, name, thread_id, started_at, ended_at, \
        args_snapshot, result_snapshot, error, sampled FROM spans WHERE run_id = $1 ORDER BY seq",
    select_summaries: "SELECT r.id, r.name, r.status, r.started_at, r.ended_at, r.metadata, r.version, r.tags,
            COUNT(s.id) AS span_count,
            CAST(COALESCE(SUM(CASE WHEN s.error IS NULL THEN 0 ELSE 1 END), 0) AS BIGINT) AS error_count
        FROM runs r LEFT JOIN spans s ON s.run_id = r.id
        WHERE 1=1",
    group_summaries: " GROUP BY r.id, r.name, r.status, r.started_at, r.ended_at, r.metadata, r.version, r.tags
        ORDER BY r.started_at DESC",
    delete_spans: "DELETE FROM spans WHERE run_id = $1",
    delete_run: "DELETE FROM runs WHERE id = $1",
};

pub(crate) const MYSQL: Dialect = Dialect {
    schema: &[
        "CREATE TABLE IF NOT EXISTS runs (
            id VARCHAR(36) PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            status VARCHAR(16) NOT NULL,
            started_at BIGINT NOT NULL,
            ended_at BIGINT NULL,
            metadata TEXT NOT NULL,
            version BIGINT NOT NULL DEFAULT 1,
            tags TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS spans (
            run_id VARCHAR(36) NOT NULL,
            id BIGINT NOT NULL,
            seq BIGINT NOT NULL,
            parent_id BIGINT NULL,
            name VARCHAR(512) NOT NULL,
            thread_id BIGINT NOT NULL,
            started_at BIGINT NOT NULL,
            ended_at BIGINT NOT NULL,
            args_snapshot MEDIUMTEXT NOT NULL,
            result_snapshot MEDIUMTEXT NULL,
            error TEXT NULL,
            sampled BOOLEAN NOT NULL,
            PRIMARY KEY (run_id, id),
            INDEX spans_run_seq (run_id, seq),
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        )",
    ],
    // Assignments run left to right, so status must be updated last.
    upsert_run: "INSERT INTO runs (id, name, status, started_at, ended_at, metadata, version, tags)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
            name = IF(status = 'active', VALUES(name), name),
            ended_at = IF(status = 'active', VALUES(ended_at), ended_at),
            metadata = IF(status = 'active', VALUES(metadata), metadata),
            tags = IF(status = 'active', VALUES(tags), tags),
            status = IF(status = 'active', VALUES(status), status)",
    insert_span: "INSERT IGNORE INTO spans (run_id, id, seq, parent_id, name, thread_id, \
        started_at, ended_at, args_snapshot, result_snapshot, error, sampled)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    select_run: "SELECT id, name, status, started_at, ended_at, metadata, version, tags FROM runs WHERE id = ?",
    select_spans: "SELECT run_id, id, seq, parent_id, name, thread_id, started_at, ended_at, \
        args_snapshot, result_snapshot, error, sampled FROM spans WHERE run_id = ? ORDER BY seq",
    select_summaries: "SELECT r.id, r.name, r.status, r.started_at, r.ended_at, r.metadata, r.version, r.tags,
            COUNT(s.id) AS span_count,
            CAST(COALESCE(SUM(CASE WHEN s.error IS NULL THEN 0 ELSE 1 END), 0) AS SIGNED) AS error_count
        FROM runs r LEFT JOIN spans s ON s.run_id = r.id
        WHERE 1=1",
    group_summaries: " GROUP BY r.id, r.name, r.status, r.started_at, r.ended_at, r.metadata, r.version, r.tags
        ORDER BY r.started_at DESC",
    delete_spans: "DELETE FROM spans WHERE run_id = ?",
    delete_run: "DELETE FROM runs WHERE id = ?",
};

pub(crate) fn to_i64(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Invalid(format!("{what} {value} out of range")))
}

fn to_u64(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Codec(format!("negative {what} {value}")))
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub(crate) struct RunRow {
    pub id: String,
    pub name: String,
    pub status: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub metadata: String,
    pub version: i64,
    /// JSON array.
    pub tags: String,
}

impl RunRow {
    pub fn from_run(run: &Run) -> Result<Self, StoreError> {
        Ok(RunRow {
            id: run.id.to_string(),
            name: run.name.clone(),
            status: run.status.as_str().to_string(),
            started_at: to_i64(run.started_at.as_nanos(), "started_at")?,
            ended_at: run
                .ended_at
                .map(|t| to_i64(t.as_nanos(), "ended_at"))
                .transpose()?,
            metadata: serde_json::to_string(&run.metadata)?,
            version: to_i64(run.version, "version")?,
            tags: serde_json::to_string(&run.tags)?,
        })
    }

    pub fn into_run(self) -> Result<Run, StoreError> {
        let metadata: BTreeMap<String, String> = serde_json::from_str(&self.metadata)?;
        let tags: Vec<String> = serde_json::from_str(&self.tags)?;
        Ok(Run {
            id: self
                .id
                .parse::<RunId>()
                .map_err(|e| StoreError::Codec(e.to_string()))?,
            name: self.name,
            status: self
                .status
                .parse::<RunStatus>()
                .map_err(|e| StoreError::Codec(e.to_string()))?,
            started_at: Timestamp(to_u64(self.started_at, "started_at")?),
            ended_at: self
                .ended_at
                .map(|t| to_u64(t, "ended_at").map(Timestamp))
                .transpose()?,
            metadata,
            version: to_u64(self.version, "version")?,
            tags,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SummaryRow {
    #[sqlx(flatten)]
    pub run: RunRow,
    pub span_count: i64,
    pub error_count: i64,
}

impl SummaryRow {
    pub fn into_parts(self) -> Result<(Run, u64, u64), StoreError> {
        let span_count = to_u64(self.span_count, "span_count")?;
        let error_count = to_u64(self.error_count, "error_count")?;
        Ok((self.run.into_run()?, span_count, error_count))
    }

}

/// Converts summary rows and applies the parts of `filter` not pushed down
/// into SQL (metadata equality, tags and the limit).
pub(crate) fn finish_summaries(
    rows: Vec<SummaryRow>,
    filter: &RunFilter,
) -> Result<Vec<RunSummary>, StoreError> {
    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
        if filter.limit.is_some_and(|limit| summaries.len() >= limit) {
            break;
        }
        let (run, spans, errors) = row.into_parts()?;
        if filter.matches(&run) {
            summaries.push(RunSummary::new(run, spans, errors));
        }
    }
    Ok(summaries)
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub(crate) struct SpanRow {
    pub run_id: String,
    pub id: i64,
    pub seq: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub thread_id: i64,
    pub started_at: i64,
    pub ended_at: i64,
    pub args_snapshot: String,
    pub result_snapshot: Option<String>,
    pub error: Option<String>,
    pub sampled: bool,
}

impl SpanRow {
    pub fn from_span(span: &Span) -> Result<Self, StoreError> {
        let (result_snapshot, error) = match &span.outcome {
            Outcome::Returned(snapshot) => (Some(serde_json::to_string(snapshot)?), None),
            Outcome::Failed(message) => (None, Some(message.clone())),
        };
        Ok(SpanRow {
            run_id: span.run_id.to_string(),
            id: to_i64(span.id.0, "span id")?,
            seq: to_i64(span.seq, "seq")?,
            parent_id: span
                .parent_id
                .map(|p| to_i64(p.0, "parent id"))
                .transpose()?,
            name: span.name.clone(),
            // Thread ids are opaque; keep the bit pattern.
            thread_id: span.thread_id as i64,
            started_at: to_i64(span.start.as_nanos(), "started_at")?,
            ended_at: to_i64(span.end.as_nanos(), "ended_at")?,
            args_snapshot: serde_json::to_string(&span.args)?,
            result_snapshot,
            error,
            sampled: span.sampled,
        })
    }

    pub fn into_span(self) -> Result<Span, StoreError> {
        let outcome = match (self.error, self.result_snapshot) {
            (Some(message), _) => Outcome::Failed(message),
            (None, Some(result)) => Outcome::Returned(serde_json::from_str::<Snapshot>(&result)?),
            (None, None) => Outcome::Returned(Snapshot::nil()),
        };
        Ok(Span {
            id: SpanId(to_u64(self.id, "span id")?),
            run_id: self
                .run_id
                .parse::<RunId>()
                .map_err(|e| StoreError::Codec(e.to_string()))?,
            parent_id: self
                .parent_id
                .map(|p| to_u64(p, "parent id").map(SpanId))
                .transpose()?,
            seq: to_u64(self.seq, "seq")?,
            name: self.name,
            thread_id: self.thread_id as u64,
            start: Timestamp(to_u64(self.started_at, "started_at")?),
            end: Timestamp(to_u64(self.ended_at, "ended_at")?),
            args: serde_json::from_str(&self.args_snapshot)?,
            outcome,
            sampled: self.sampled,
        })
    }
}
