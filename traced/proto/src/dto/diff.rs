use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::types::RunId;

/// One step of a span path: the function name and its position among
/// same-named siblings, in call order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    pub name: String,
    pub index: usize,
}

/// Location of a span in its run's call tree, from the root down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanPath(pub Vec<PathSegment>);

impl SpanPath {
    pub fn root() -> Self {
        SpanPath(Vec::new())
    }

    pub fn child<N: Into<String>>(&self, name: N, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment {
            name: name.into(),
            index,
        });
        SpanPath(segments)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl Display for SpanPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for segment in &self.0 {
            if !first {
                f.write_str("/")?;
            }
            first = false;
            write!(f, "{}[{}]", segment.name, segment.index)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    ChangedResult,
    ChangedDuration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: SpanPath,
    pub kind: ChangeKind,
    pub detail: String,
}

/// Structural comparison of two runs. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub run_a: RunId,
    pub run_b: RunId,
    pub entries: Vec<DiffEntry>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }
}
