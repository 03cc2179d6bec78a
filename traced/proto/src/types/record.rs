use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ProtoError, RunId, Snapshot, SpanId, Timestamp};

/// Lifecycle state of a run.
///
/// A run leaves `Active` exactly once and is immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Active)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(RunStatus::Active),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(ProtoError::UnknownStatus(other.to_string())),
        }
    }
}

/// One tracing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub name: String,
    pub status: RunStatus,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    /// Opaque annotations supplied at creation (commit hash, environment tags).
    pub metadata: BTreeMap<String, String>,
    /// 1 for the first run of a name, one more for each later run of it.
    #[serde(default = "first_version")]
    pub version: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn first_version() -> u64 {
    1
}

impl Run {
    pub fn new<N: Into<String>>(name: N, metadata: BTreeMap<String, String>) -> Self {
        Run {
            id: RunId::new(),
            name: name.into(),
            status: RunStatus::Active,
            started_at: Timestamp::now(),
            ended_at: None,
            metadata,
            version: first_version(),
            tags: Vec::new(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.ended_at.map(|end| end.duration_since(self.started_at))
    }
}

/// How a recorded invocation finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Returned(Snapshot),
    Failed(String),
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn result(&self) -> Option<&Snapshot> {
        match self {
            Outcome::Returned(snapshot) => Some(snapshot),
            Outcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Returned(_) => None,
            Outcome::Failed(message) => Some(message),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Outcome::Returned(snapshot) => snapshot.render(),
            Outcome::Failed(message) => format!("error: {message}"),
        }
    }
}

/// One closed, recorded function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: SpanId,
    pub run_id: RunId,
    pub parent_id: Option<SpanId>,
    /// Close order within the run, assigned when the span enters the buffer.
    pub seq: u64,
    pub name: String,
    pub thread_id: u64,
    pub start: Timestamp,
    pub end: Timestamp,
    pub args: Snapshot,
    pub outcome: Outcome,
    /// `false` when the span was forced by an always-trace annotation.
    pub sampled: bool,
}

impl Span {
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether `self` lies within the interval of `parent`.
    pub fn nests_within(&self, parent: &Span) -> bool {
        self.run_id == parent.run_id && parent.start <= self.start && self.end <= parent.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn span(id: u64, parent: Option<u64>, start: u64, end: u64) -> Span {
        Span {
            id: SpanId(id),
            run_id: RunId(uuid::Uuid::nil()),
            parent_id: parent.map(SpanId),
            seq: id,
            name: format!("fn{id}"),
            thread_id: 1,
            start: Timestamp(start),
            end: Timestamp(end),
            args: Snapshot::Inline(Value::List(vec![])),
            outcome: Outcome::Returned(Snapshot::nil()),
            sampled: true,
        }
    }

    #[test]
    fn test_status_parse_and_display() {
        for status in [RunStatus::Active, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(status.to_string().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
        assert!(!RunStatus::Active.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_nesting_check() {
        let parent = span(1, None, 10, 100);
        let child = span(2, Some(1), 20, 90);
        let escaped = span(3, Some(1), 20, 120);
        assert!(child.nests_within(&parent));
        assert!(!escaped.nests_within(&parent));
        assert_eq!(child.duration(), Duration::from_nanos(70));
    }

    #[test]
    fn test_outcome_accessors() {
        let ok = Outcome::Returned(Snapshot::Inline(Value::Int(7)));
        assert_eq!(ok.render(), "7");
        assert!(ok.error().is_none());

        let failed = Outcome::Failed("ValueError: boom".to_string());
        assert!(failed.is_error());
        assert!(failed.result().is_none());
        assert_eq!(failed.render(), "error: ValueError: boom");
    }
}
