// Handler tests drive the axum handlers directly with their extractors.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use traced_core::store::SledStore;
use traced_core::{QueryService, TraceStore, Tracer};
use traced_proto::prelude::{
    ChangeKind, Outcome, Run, RunId, RunStatus, Snapshot, Span, SpanId, Timestamp, Value,
};
use traced_server::server::query_api::{
    delete_run, diff_runs, get_run, list_runs, run_stats, DiffParams,
};
use traced_server::{AppState, Broadcaster};

fn span(run: RunId, seq: u64, name: &str, start: u64, end: u64, result: i64) -> Span {
    Span {
        id: SpanId(seq),
        run_id: run,
        parent_id: None,
        seq,
        name: name.to_string(),
        thread_id: 1,
        start: Timestamp(start),
        end: Timestamp(end),
        args: Snapshot::nil(),
        outcome: Outcome::Returned(Snapshot::Inline(Value::Int(result))),
        sampled: true,
    }
}

async fn seed(store: &SledStore, name: &str, commit: &str, tags: &[&str], result: i64) -> RunId {
    let mut metadata = BTreeMap::new();
    metadata.insert("git_commit".to_string(), commit.to_string());
    let mut run = Run::new(name, metadata);
    run.tags = tags.iter().map(|t| t.to_string()).collect();
    run.status = RunStatus::Completed;
    run.ended_at = Some(Timestamp::now());
    store.write_run(&run).await.unwrap();
    store
        .write_spans(
            &run.id,
            &[span(run.id, 1, "train", 0, 1000, result), span(run.id, 2, "eval", 1000, 1200, 1)],
        )
        .await
        .unwrap();
    run.id
}

async fn state() -> (AppState, RunId, RunId) {
    let store = Arc::new(SledStore::temporary().unwrap());
    let a = seed(&store, "baseline", "abc", &["nightly", "gpu"], 10).await;
    let b = seed(&store, "candidate", "def", &["gpu"], 11).await;
    let tracer = Tracer::builder().with_store(store.clone()).build();
    let live = Broadcaster::spawn(&tracer).unwrap();
    (AppState::new(QueryService::new(store), live), a, b)
}

#[tokio::test]
async fn test_list_runs_with_filters() {
    let (state, a, _) = state().await;

    let all = list_runs(State(state.clone()), Query(HashMap::new()))
        .await
        .unwrap();
    assert_eq!(all.0.len(), 2);

    let mut params = HashMap::new();
    params.insert("meta.git_commit".to_string(), "abc".to_string());
    let filtered = list_runs(State(state.clone()), Query(params)).await.unwrap();
    assert_eq!(filtered.0.len(), 1);
    assert_eq!(filtered.0[0].id, a);
    assert_eq!(filtered.0[0].span_count, 2);

    let mut params = HashMap::new();
    params.insert("tags".to_string(), "gpu,nightly".to_string());
    let tagged = list_runs(State(state.clone()), Query(params)).await.unwrap();
    assert_eq!(tagged.0.len(), 1);
    assert_eq!(tagged.0[0].id, a);
    assert_eq!(tagged.0[0].tags, vec!["nightly", "gpu"]);
    assert_eq!(tagged.0[0].version, 1);

    let mut bad = HashMap::new();
    bad.insert("limit".to_string(), "many".to_string());
    let err = list_runs(State(state), Query(bad)).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_run_and_stats() {
    let (state, a, _) = state().await;

    let detail = get_run(State(state.clone()), Path(a.to_string()))
        .await
        .unwrap();
    assert_eq!(detail.0.spans.len(), 2);

    let stats = run_stats(State(state.clone()), Path(a.to_string()))
        .await
        .unwrap();
    assert_eq!(stats.0[0].name, "train");

    let missing = get_run(State(state.clone()), Path(RunId::new().to_string()))
        .await
        .unwrap_err();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let malformed = get_run(State(state), Path("nope".to_string()))
        .await
        .unwrap_err();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_diff_endpoint() {
    let (state, a, b) = state().await;
    let diff = diff_runs(
        State(state.clone()),
        Path((a.to_string(), b.to_string())),
        Query(DiffParams::default()),
    )
    .await
    .unwrap();
    assert_eq!(diff.0.entries.len(), 1);
    assert_eq!(diff.0.entries[0].kind, ChangeKind::ChangedResult);
    assert_eq!(diff.0.entries[0].path.to_string(), "train[0]");

    let negative = diff_runs(
        State(state.clone()),
        Path((a.to_string(), b.to_string())),
        Query(DiffParams {
            threshold: Some(-0.5),
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(negative.status(), StatusCode::BAD_REQUEST);

    let unknown = diff_runs(
        State(state),
        Path((a.to_string(), RunId::new().to_string())),
        Query(DiffParams::default()),
    )
    .await
    .unwrap_err();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_run() {
    let (state, a, _) = state().await;
    let status = delete_run(State(state.clone()), Path(a.to_string()))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::NO_CONTENT);

    let again = delete_run(State(state), Path(a.to_string()))
        .await
        .unwrap_err();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}
