use std::collections::HashMap;

use traced_proto::prelude::{FunctionStats, Span};

/// Per-function aggregates over the spans of one run, heaviest first.
///
/// Sampling weights are ignored: counts reflect recorded spans only.
pub fn summarize(spans: &[Span]) -> Vec<FunctionStats> {
    let mut by_name: HashMap<&str, FunctionStats> = HashMap::new();
    for span in spans {
        let ns = span.duration().as_nanos() as u64;
        let entry = by_name
            .entry(span.name.as_str())
            .or_insert_with(|| FunctionStats {
                name: span.name.clone(),
                calls: 0,
                errors: 0,
                sampled_calls: 0,
                total_ns: 0,
                mean_ns: 0,
                max_ns: 0,
            });
        entry.calls += 1;
        entry.total_ns = entry.total_ns.saturating_add(ns);
        entry.max_ns = entry.max_ns.max(ns);
        if span.outcome.is_error() {
            entry.errors += 1;
        }
        if span.sampled {
            entry.sampled_calls += 1;
        }
    }

    let mut stats: Vec<FunctionStats> = by_name
        .into_values()
        .map(|mut s| {
            s.mean_ns = s.total_ns / s.calls.max(1);
            s
        })
        .collect();
    stats.sort_by(|a, b| b.total_ns.cmp(&a.total_ns).then_with(|| a.name.cmp(&b.name)));
    stats
}
