//! Embedded backend on sled.
//!
//! Runs live in the `runs` tree keyed by the run id bytes. Spans live in the
//! `spans` tree under `run id ++ seq (big endian)`, so a prefix scan returns
//! a run's spans in close order.

use std::path::Path;

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Batch, Transactional};
use traced_proto::prelude::{Run, RunFilter, RunId, RunSummary, Span};

use super::{Engine, StoreError, TraceStore};

const RUNS_TREE: &str = "runs";
const SPANS_TREE: &str = "spans";

#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
    runs: sled::Tree,
    spans: sled::Tree,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// A store that lives only as long as the process, for tests.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let runs = db.open_tree(RUNS_TREE)?;
        let spans = db.open_tree(SPANS_TREE)?;
        Ok(SledStore { db, runs, spans })
    }

    /// The underlying database, for stores that share it (blobs).
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    fn span_key(run_id: &RunId, seq: u64) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(run_id.as_bytes());
        key[16..].copy_from_slice(&seq.to_be_bytes());
        key
    }

    fn decode_run(bytes: &[u8]) -> Result<Run, StoreError> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn summarize(&self, run: Run) -> Result<RunSummary, StoreError> {
        let mut span_count = 0u64;
        let mut error_count = 0u64;
        for entry in self.spans.scan_prefix(run.id.as_bytes()) {
            let (_, bytes) = entry?;
            let span: Span = bincode::deserialize(&bytes)?;
            span_count += 1;
            if span.outcome.is_error() {
                error_count += 1;
            }
        }
        Ok(RunSummary::new(run, span_count, error_count))
    }
}

#[async_trait]
impl TraceStore for SledStore {
    fn engine(&self) -> Engine {
        Engine::Sled
    }

    async fn write_run(&self, run: &Run) -> Result<(), StoreError> {
        let encoded = bincode::serialize(run)?;
        self.runs.fetch_and_update(run.id.as_bytes(), |old| match old {
            Some(bytes) => match Self::decode_run(bytes) {
                Ok(stored) if stored.status.is_terminal() => Some(bytes.to_vec()),
                _ => Some(encoded.clone()),
            },
            None => Some(encoded.clone()),
        })?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn write_spans(&self, run_id: &RunId, spans: &[Span]) -> Result<(), StoreError> {
        let mut batch = Batch::default();
        for span in spans {
            if &span.run_id != run_id {
                return Err(StoreError::Invalid(format!(
                    "span {} belongs to run {}, not {run_id}",
                    span.id, span.run_id
                )));
            }
            batch.insert(&Self::span_key(run_id, span.seq)[..], bincode::serialize(span)?);
        }
        self.spans.apply_batch(batch)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn read_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        self.runs
            .get(run_id.as_bytes())?
            .map(|bytes| Self::decode_run(&bytes))
            .transpose()
    }

    async fn read_spans(&self, run_id: &RunId) -> Result<Vec<Span>, StoreError> {
        self.spans
            .scan_prefix(run_id.as_bytes())
            .map(|entry| {
                let (_, bytes) = entry?;
                Ok(bincode::deserialize(&bytes)?)
            })
            .collect()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
        let mut runs = Vec::new();
        for entry in self.runs.iter() {
            let (_, bytes) = entry?;
            let run = Self::decode_run(&bytes)?;
            if filter.matches(&run) {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            runs.truncate(limit);
        }
        runs.into_iter().map(|run| self.summarize(run)).collect()
    }

    async fn delete_run(&self, run_id: &RunId) -> Result<bool, StoreError> {
        let span_keys: Vec<sled::IVec> = self
            .spans
            .scan_prefix(run_id.as_bytes())
            .keys()
            .collect::<Result<_, _>>()?;

        let existed = (&self.runs, &self.spans)
            .transaction(|(runs, spans)| {
                let existed = runs.remove(&run_id.as_bytes()[..])?.is_some();
                for key in &span_keys {
                    spans.remove(key.clone())?;
                }
                Ok::<_, ConflictableTransactionError<()>>(existed)
            })
            .map_err(|e: TransactionError<()>| StoreError::Backend(format!("{e:?}")))?;
        self.db.flush_async().await?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use traced_proto::prelude::{Outcome, RunStatus, Snapshot, SpanId, Timestamp, Value};

    fn span(run: &Run, id: u64, seq: u64, parent: Option<u64>) -> Span {
        Span {
            id: SpanId(id),
            run_id: run.id,
            parent_id: parent.map(SpanId),
            seq,
            name: format!("fn{id}"),
            thread_id: 1,
            start: Timestamp(100 + id),
            end: Timestamp(200 - id),
            args: Snapshot::Inline(Value::List(vec![Value::Int(id as i64)])),
            outcome: Outcome::Returned(Snapshot::nil()),
            sampled: true,
        }
    }

    #[tokio::test]
    async fn test_spans_read_back_in_seq_order() {
        let store = SledStore::temporary().unwrap();
        let run = Run::new("order", BTreeMap::new());
        store.write_run(&run).await.unwrap();
        store
            .write_spans(&run.id, &[span(&run, 30, 3, None), span(&run, 10, 1, Some(30))])
            .await
            .unwrap();
        store
            .write_spans(&run.id, &[span(&run, 20, 2, Some(30))])
            .await
            .unwrap();

        let spans = store.read_spans(&run.id).await.unwrap();
        let seqs: Vec<_> = spans.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(spans[0].parent_id, Some(SpanId(30)));
    }

    #[tokio::test]
    async fn test_written_spans_read_back_equal() {
        let store = SledStore::temporary().unwrap();
        let run = Run::new("fidelity", BTreeMap::new());
        store.write_run(&run).await.unwrap();

        let root = Span {
            args: Snapshot::Inline(Value::Map(vec![
                ("n".to_string(), Value::Float(2.5)),
                ("label".to_string(), Value::Text("héllo".to_string())),
                ("raw".to_string(), Value::Bytes(vec![0, 255])),
            ])),
            outcome: Outcome::Returned(Snapshot::Truncated {
                preview: "[1, 2, 3".to_string(),
                original_bytes: 4096,
            }),
            ..span(&run, 1, 3, None)
        };
        let failed = Span {
            outcome: Outcome::Failed("division by zero".to_string()),
            sampled: false,
            ..span(&run, 2, 1, Some(1))
        };
        let nested = Span {
            args: Snapshot::Blob {
                key: "ab12".to_string(),
                bytes: 70_000,
            },
            outcome: Outcome::Returned(Snapshot::Unserializable {
                type_name: "Socket".to_string(),
            }),
            ..span(&run, 3, 2, Some(2))
        };
        let written = vec![failed, nested, root];
        store.write_spans(&run.id, &written).await.unwrap();

        assert_eq!(store.read_spans(&run.id).await.unwrap(), written);
    }

    #[tokio::test]
    async fn test_terminal_run_is_never_downgraded() {
        let store = SledStore::temporary().unwrap();
        let mut run = Run::new("immutable", BTreeMap::new());
        store.write_run(&run).await.unwrap();

        run.status = RunStatus::Completed;
        run.ended_at = Some(Timestamp::now());
        store.write_run(&run).await.unwrap();

        let mut stale = run.clone();
        stale.status = RunStatus::Active;
        stale.ended_at = None;
        store.write_run(&stale).await.unwrap();

        let stored = store.read_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_foreign_span_rejects_whole_batch() {
        let store = SledStore::temporary().unwrap();
        let run = Run::new("a", BTreeMap::new());
        let other = Run::new("b", BTreeMap::new());
        let result = store
            .write_spans(&run.id, &[span(&run, 1, 1, None), span(&other, 2, 1, None)])
            .await;
        assert!(matches!(result, Err(StoreError::Invalid(_))));
        assert!(store.read_spans(&run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let store = SledStore::temporary().unwrap();
        let older = Run::new("train", BTreeMap::new());
        let mut newer = Run::new("eval", BTreeMap::new());
        newer.started_at = Timestamp(older.started_at.0 + 1);
        store.write_run(&older).await.unwrap();
        store.write_run(&newer).await.unwrap();
        let mut failing = span(&older, 1, 1, None);
        failing.outcome = Outcome::Failed("ValueError: x".into());
        store
            .write_spans(&older.id, &[failing, span(&older, 2, 2, None)])
            .await
            .unwrap();

        let all = store.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, newer.id);
        assert_eq!(all[1].span_count, 2);
        assert_eq!(all[1].error_count, 1);

        let named = store
            .list_runs(&RunFilter::default().with_name("train"))
            .await
            .unwrap();
        assert_eq!(named.len(), 1);

        assert!(store.delete_run(&older.id).await.unwrap());
        assert!(!store.delete_run(&older.id).await.unwrap());
        assert!(store.read_run(&older.id).await.unwrap().is_none());
        assert!(store.read_spans(&older.id).await.unwrap().is_empty());
    }
}
