//! Query interface DTOs consumed by the dashboard and external tooling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Run, RunId, RunStatus, Span, Timestamp};

/// Selection criteria for `list_runs`. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    pub name: Option<String>,
    pub status: Option<RunStatus>,
    pub started_after: Option<Timestamp>,
    pub started_before: Option<Timestamp>,
    /// Every entry must be present with an equal value in the run metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Every tag must be carried by the run.
    #[serde(default)]
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tag<T: Into<String>>(mut self, tag: T) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, run: &Run) -> bool {
        if let Some(name) = &self.name {
            if &run.name != name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(after) = self.started_after {
            if run.started_at < after {
                return false;
            }
        }
        if let Some(before) = self.started_before {
            if run.started_at > before {
                return false;
            }
        }
        self.tags.iter().all(|tag| run.has_tag(tag))
            && self
                .metadata
                .iter()
                .all(|(k, v)| run.metadata.get(k) == Some(v))
    }
}

/// One row of `list_runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub name: String,
    pub status: RunStatus,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    pub metadata: BTreeMap<String, String>,
    pub version: u64,
    pub tags: Vec<String>,
    pub span_count: u64,
    pub error_count: u64,
}

impl RunSummary {
    pub fn new(run: Run, span_count: u64, error_count: u64) -> Self {
        RunSummary {
            id: run.id,
            name: run.name,
            status: run.status,
            started_at: run.started_at,
            ended_at: run.ended_at,
            metadata: run.metadata,
            version: run.version,
            tags: run.tags,
            span_count,
            error_count,
        }
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.ended_at
            .map(|end| end.duration_since(self.started_at).as_secs_f64() * 1000.0)
    }
}

/// A run together with its spans ordered by close sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: Run,
    pub spans: Vec<Span>,
}

/// Aggregate timings for one function name within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionStats {
    pub name: String,
    pub calls: u64,
    pub errors: u64,
    /// Calls recorded by probabilistic sampling rather than forced tracing.
    pub sampled_calls: u64,
    pub total_ns: u64,
    pub mean_ns: u64,
    pub max_ns: u64,
}
