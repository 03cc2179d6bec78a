//! Structural comparison of two runs.
//!
//! Spans are matched by their path from the root, where each step is a
//! function name plus the occurrence index among same-named siblings in
//! call order. Identifiers never take part in matching.

use std::collections::HashMap;
use std::sync::Arc;

use traced_proto::prelude::{
    ChangeKind, DiffEntry, DiffResult, Outcome, RunId, Snapshot, Span, SpanId, SpanPath,
};

use crate::store::{StoreError, TraceStore};

#[derive(Debug, thiserror::Error)]
pub enum CompareError {
    #[error("run {0} not found")]
    NotFound(RunId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Loads two runs from a store and diffs them.
#[derive(Debug, Clone)]
pub struct RunComparator {
    store: Arc<dyn TraceStore>,
    threshold: f64,
}

impl RunComparator {
    pub fn new(store: Arc<dyn TraceStore>, threshold: f64) -> Self {
        RunComparator { store, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub async fn diff(&self, run_a: RunId, run_b: RunId) -> Result<DiffResult, CompareError> {
        self.diff_with_threshold(run_a, run_b, self.threshold).await
    }

    pub async fn diff_with_threshold(
        &self,
        run_a: RunId,
        run_b: RunId,
        threshold: f64,
    ) -> Result<DiffResult, CompareError> {
        let spans_a = self.load(run_a).await?;
        let spans_b = self.load(run_b).await?;
        log::debug!(
            "diffing run {run_a} ({} spans) against {run_b} ({} spans)",
            spans_a.len(),
            spans_b.len()
        );
        Ok(diff_spans(run_a, run_b, &spans_a, &spans_b, threshold))
    }

    async fn load(&self, run: RunId) -> Result<Vec<Span>, CompareError> {
        if self.store.read_run(&run).await?.is_none() {
            return Err(CompareError::NotFound(run));
        }
        Ok(self.store.read_spans(&run).await?)
    }
}

struct Tree<'a> {
    spans: &'a [Span],
    roots: Vec<usize>,
    children: HashMap<SpanId, Vec<usize>>,
}

impl<'a> Tree<'a> {
    /// Spans whose parent is missing (unsampled or dropped) become roots.
    fn build(spans: &'a [Span]) -> Self {
        let known: HashMap<SpanId, usize> =
            spans.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
        let mut roots = Vec::new();
        let mut children: HashMap<SpanId, Vec<usize>> = HashMap::new();
        for (i, span) in spans.iter().enumerate() {
            match span.parent_id.filter(|p| known.contains_key(p)) {
                Some(parent) => children.entry(parent).or_default().push(i),
                None => roots.push(i),
            }
        }
        let by_call_order = |a: &usize, b: &usize| {
            (spans[*a].start, spans[*a].seq).cmp(&(spans[*b].start, spans[*b].seq))
        };
        roots.sort_by(by_call_order);
        for list in children.values_mut() {
            list.sort_by(by_call_order);
        }
        Tree {
            spans,
            roots,
            children,
        }
    }

    fn children(&self, idx: usize) -> &[usize] {
        self.children
            .get(&self.spans[idx].id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn subtree_size(&self, idx: usize) -> usize {
        1 + self
            .children(idx)
            .iter()
            .map(|c| self.subtree_size(*c))
            .sum::<usize>()
    }
}

/// Diffs two span sets. Diffing a run against itself yields no entries.
pub fn diff_spans(
    run_a: RunId,
    run_b: RunId,
    spans_a: &[Span],
    spans_b: &[Span],
    threshold: f64,
) -> DiffResult {
    let a = Tree::build(spans_a);
    let b = Tree::build(spans_b);
    let mut entries = Vec::new();
    diff_level(
        &a,
        &a.roots,
        &b,
        &b.roots,
        &SpanPath::root(),
        threshold,
        &mut entries,
    );
    DiffResult {
        run_a,
        run_b,
        entries,
    }
}

fn group_by_name<'s>(tree: &'s Tree<'_>, nodes: &[usize]) -> Vec<(&'s str, Vec<usize>)> {
    let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
    for &idx in nodes {
        let name = tree.spans[idx].name.as_str();
        match groups.iter_mut().find(|(n, _)| *n == name) {
            Some((_, list)) => list.push(idx),
            None => groups.push((name, vec![idx])),
        }
    }
    groups
}

fn diff_level(
    a: &Tree<'_>,
    nodes_a: &[usize],
    b: &Tree<'_>,
    nodes_b: &[usize],
    path: &SpanPath,
    threshold: f64,
    out: &mut Vec<DiffEntry>,
) {
    let groups_a = group_by_name(a, nodes_a);
    let groups_b = group_by_name(b, nodes_b);

    let mut names: Vec<&str> = groups_a.iter().map(|(n, _)| *n).collect();
    for (name, _) in &groups_b {
        if !names.contains(name) {
            names.push(name);
        }
    }

    let empty = Vec::new();
    for name in names {
        let list_a = groups_a
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(&empty, |(_, l)| l);
        let list_b = groups_b
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(&empty, |(_, l)| l);

        for i in 0..list_a.len().max(list_b.len()) {
            let here = path.child(name, i);
            match (list_a.get(i), list_b.get(i)) {
                (Some(&ia), Some(&ib)) => {
                    compare_pair(&a.spans[ia], &b.spans[ib], &here, threshold, out);
                    diff_level(a, a.children(ia), b, b.children(ib), &here, threshold, out);
                }
                (Some(&ia), None) => out.push(DiffEntry {
                    path: here,
                    kind: ChangeKind::Removed,
                    detail: subtree_detail(a.subtree_size(ia)),
                }),
                (None, Some(&ib)) => out.push(DiffEntry {
                    path: here,
                    kind: ChangeKind::Added,
                    detail: subtree_detail(b.subtree_size(ib)),
                }),
                (None, None) => {}
            }
        }
    }
}

fn subtree_detail(size: usize) -> String {
    if size == 1 {
        "1 span".to_string()
    } else {
        format!("{size} spans")
    }
}

fn compare_pair(a: &Span, b: &Span, path: &SpanPath, threshold: f64, out: &mut Vec<DiffEntry>) {
    let left = pretty(&a.outcome);
    let right = pretty(&b.outcome);
    if left != right {
        out.push(DiffEntry {
            path: path.clone(),
            kind: ChangeKind::ChangedResult,
            detail: line_diff(&left, &right),
        });
    }

    let da = a.duration().as_nanos() as f64;
    let db = b.duration().as_nanos() as f64;
    let change = (db - da) / da.max(1.0);
    if change.abs() > threshold {
        out.push(DiffEntry {
            path: path.clone(),
            kind: ChangeKind::ChangedDuration,
            detail: format!(
                "{:?} -> {:?} ({:+.1}%)",
                a.duration(),
                b.duration(),
                change * 100.0
            ),
        });
    }
}

/// Multi-line rendering so that structured results diff line by line.
fn pretty(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Returned(Snapshot::Inline(value)) => {
            serde_json::to_string_pretty(&value.to_json()).unwrap_or_else(|_| value.to_string())
        }
        other => other.render(),
    }
}

/// Line diff over the longest common subsequence. Lines only in `a` are
/// prefixed `- `, lines only in `b` `+ `, shared lines two spaces.
pub fn line_diff(a: &str, b: &str) -> String {
    let left: Vec<&str> = a.lines().collect();
    let right: Vec<&str> = b.lines().collect();
    let (n, m) = (left.len(), right.len());

    // lcs[i][j] = LCS length of left[i..] and right[j..]
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if left[i] == right[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut lines = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if left[i] == right[j] {
            lines.push(format!("  {}", left[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            lines.push(format!("- {}", left[i]));
            i += 1;
        } else {
            lines.push(format!("+ {}", right[j]));
            j += 1;
        }
    }
    lines.extend(left[i..].iter().map(|l| format!("- {l}")));
    lines.extend(right[j..].iter().map(|l| format!("+ {l}")));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use traced_proto::prelude::{Run, Timestamp, Value};

    use crate::store::SledStore;

    struct Builder {
        run: RunId,
        spans: Vec<Span>,
        next: u64,
    }

    impl Builder {
        fn new() -> Self {
            Builder {
                run: RunId::new(),
                spans: Vec::new(),
                next: 1,
            }
        }

        fn add(&mut self, name: &str, parent: Option<SpanId>, start: u64, end: u64, result: i64) -> SpanId {
            let id = SpanId(self.next * 1000 + start);
            self.spans.push(Span {
                id,
                run_id: self.run,
                parent_id: parent,
                seq: self.next,
                name: name.to_string(),
                thread_id: 1,
                start: Timestamp(start),
                end: Timestamp(end),
                args: Snapshot::nil(),
                outcome: Outcome::Returned(Snapshot::Inline(Value::Int(result))),
                sampled: true,
            });
            self.next += 1;
            id
        }
    }

    fn baseline() -> Builder {
        let mut b = Builder::new();
        let f = b.add("f", None, 0, 1000, 14);
        b.add("g", Some(f), 100, 200, 6);
        b.add("g", Some(f), 300, 400, 8);
        b
    }

    #[test]
    fn test_self_diff_is_empty() {
        let a = baseline();
        let diff = diff_spans(a.run, a.run, &a.spans, &a.spans, 0.2);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_changed_result_is_matched_by_call_order() {
        let a = baseline();
        let mut b = Builder::new();
        let f = b.add("f", None, 10, 1010, 14);
        b.add("g", Some(f), 110, 210, 6);
        b.add("g", Some(f), 310, 410, 9);

        let diff = diff_spans(a.run, b.run, &a.spans, &b.spans, 0.2);
        assert_eq!(diff.entries.len(), 1);
        let entry = &diff.entries[0];
        assert_eq!(entry.kind, ChangeKind::ChangedResult);
        assert_eq!(entry.path.to_string(), "f[0]/g[1]");
        assert_eq!(entry.detail, "- 8\n+ 9");
    }

    #[test]
    fn test_added_and_removed_subtrees() {
        let a = baseline();
        let mut b = Builder::new();
        let f = b.add("f", None, 0, 1000, 14);
        b.add("g", Some(f), 100, 200, 6);
        let h = b.add("h", Some(f), 300, 400, 0);
        b.add("k", Some(h), 310, 320, 0);

        let diff = diff_spans(a.run, b.run, &a.spans, &b.spans, 0.2);
        assert_eq!(diff.count(ChangeKind::Removed), 1);
        assert_eq!(diff.count(ChangeKind::Added), 1);
        let added = diff
            .entries
            .iter()
            .find(|e| e.kind == ChangeKind::Added)
            .unwrap();
        assert_eq!(added.path.to_string(), "f[0]/h[0]");
        assert_eq!(added.detail, "2 spans");
        let removed = diff
            .entries
            .iter()
            .find(|e| e.kind == ChangeKind::Removed)
            .unwrap();
        assert_eq!(removed.path.to_string(), "f[0]/g[1]");
    }

    #[test]
    fn test_duration_threshold_filters_noise() {
        let a = baseline();
        let mut b = Builder::new();
        let f = b.add("f", None, 0, 1100, 14);
        b.add("g", Some(f), 100, 210, 6);
        b.add("g", Some(f), 300, 700, 8);

        let diff = diff_spans(a.run, b.run, &a.spans, &b.spans, 0.2);
        let flagged: Vec<_> = diff.entries.iter().map(|e| e.path.to_string()).collect();
        assert_eq!(flagged, vec!["f[0]/g[1]".to_string()]);
        assert_eq!(diff.entries[0].kind, ChangeKind::ChangedDuration);
        assert!(diff.entries[0].detail.contains("+300.0%"));
    }

    #[test]
    fn test_orphans_are_treated_as_roots() {
        let mut a = Builder::new();
        a.add("g", Some(SpanId(999_999)), 0, 10, 1);
        let diff = diff_spans(a.run, a.run, &a.spans, &a.spans, 0.2);
        assert!(diff.is_empty());
        assert_eq!(Tree::build(&a.spans).roots.len(), 1);
    }

    #[test]
    fn test_line_diff_on_structured_results() {
        let left = "{\n  \"loss\": 0.5,\n  \"step\": 3\n}";
        let right = "{\n  \"loss\": 0.4,\n  \"step\": 3\n}";
        assert_eq!(
            line_diff(left, right),
            "  {\n-   \"loss\": 0.5,\n+   \"loss\": 0.4,\n    \"step\": 3\n  }"
        );
    }

    #[tokio::test]
    async fn test_comparator_reports_missing_runs() {
        let store = Arc::new(SledStore::temporary().unwrap());
        let run = Run::new("present", BTreeMap::new());
        store.write_run(&run).await.unwrap();

        let comparator = RunComparator::new(store, 0.2);
        let diff = comparator.diff(run.id, run.id).await.unwrap();
        assert!(diff.is_empty());

        let missing = RunId::new();
        assert!(matches!(
            comparator.diff(run.id, missing).await,
            Err(CompareError::NotFound(id)) if id == missing
        ));
    }
}
