//! Read side used by the dashboard and external tooling.

use std::sync::Arc;

use traced_proto::prelude::{DiffResult, FunctionStats, RunDetail, RunFilter, RunId, RunSummary};

use crate::blob::BlobStore;
use crate::compare::{CompareError, RunComparator};
use crate::config::TracerConfig;
use crate::stats;
use crate::store::{StoreError, TraceStore};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("blob {0} not found")]
    BlobNotFound(String),

    #[error("no blob store configured")]
    NoBlobStore,

    #[error("invalid threshold {0}")]
    InvalidThreshold(f64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CompareError> for QueryError {
    fn from(err: CompareError) -> Self {
        match err {
            CompareError::NotFound(id) => QueryError::NotFound(id),
            CompareError::Store(e) => QueryError::Store(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryService {
    store: Arc<dyn TraceStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    comparator: RunComparator,
}

impl QueryService {
    pub fn new(store: Arc<dyn TraceStore>) -> Self {
        let threshold = TracerConfig::default().duration_threshold;
        QueryService {
            comparator: RunComparator::new(store.clone(), threshold),
            store,
            blobs: None,
        }
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_duration_threshold(mut self, threshold: f64) -> Self {
        self.comparator = RunComparator::new(self.store.clone(), threshold);
        self
    }

    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, QueryError> {
        Ok(self.store.list_runs(filter).await?)
    }

    pub async fn get_run(&self, id: RunId) -> Result<RunDetail, QueryError> {
        let run = self
            .store
            .read_run(&id)
            .await?
            .ok_or(QueryError::NotFound(id))?;
        let spans = self.store.read_spans(&id).await?;
        Ok(RunDetail { run, spans })
    }

    pub async fn run_stats(&self, id: RunId) -> Result<Vec<FunctionStats>, QueryError> {
        let detail = self.get_run(id).await?;
        Ok(stats::summarize(&detail.spans))
    }

    /// `threshold` overrides the configured relative duration threshold.
    pub async fn diff_runs(
        &self,
        run_a: RunId,
        run_b: RunId,
        threshold: Option<f64>,
    ) -> Result<DiffResult, QueryError> {
        let threshold = threshold.unwrap_or(self.comparator.threshold());
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(QueryError::InvalidThreshold(threshold));
        }
        Ok(self
            .comparator
            .diff_with_threshold(run_a, run_b, threshold)
            .await?)
    }

    pub async fn delete_run(&self, id: RunId) -> Result<(), QueryError> {
        if self.store.delete_run(&id).await? {
            log::info!("deleted run {id}");
            Ok(())
        } else {
            Err(QueryError::NotFound(id))
        }
    }

    pub async fn load_blob(&self, key: &str) -> Result<Vec<u8>, QueryError> {
        let blobs = self.blobs.as_ref().ok_or(QueryError::NoBlobStore)?;
        blobs
            .get(key)
            .await?
            .ok_or_else(|| QueryError::BlobNotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use traced_proto::prelude::{Outcome, Run, RunStatus, Snapshot, Span, SpanId, Timestamp};

    use crate::blob::MemoryBlobStore;
    use crate::store::SledStore;

    fn span(run: RunId, id: u64, name: &str, start: u64, end: u64) -> Span {
        Span {
            id: SpanId(id),
            run_id: run,
            parent_id: None,
            seq: id,
            name: name.to_string(),
            thread_id: 1,
            start: Timestamp(start),
            end: Timestamp(end),
            args: Snapshot::nil(),
            outcome: Outcome::Returned(Snapshot::nil()),
            sampled: true,
        }
    }

    async fn seeded() -> (QueryService, Run) {
        let store = Arc::new(SledStore::temporary().unwrap());
        let mut run = Run::new("baseline", BTreeMap::new());
        run.status = RunStatus::Completed;
        run.ended_at = Some(Timestamp::now());
        store.write_run(&run).await.unwrap();
        store
            .write_spans(
                &run.id,
                &[span(run.id, 1, "step", 0, 100), span(run.id, 2, "step", 200, 400)],
            )
            .await
            .unwrap();
        (QueryService::new(store), run)
    }

    #[tokio::test]
    async fn test_get_run_and_stats() {
        let (service, run) = seeded().await;
        let detail = service.get_run(run.id).await.unwrap();
        assert_eq!(detail.run.id, run.id);
        assert_eq!(detail.spans.len(), 2);

        let stats = service.run_stats(run.id).await.unwrap();
        assert_eq!(stats[0].calls, 2);
        assert_eq!(stats[0].total_ns, 300);

        let runs = service.list_runs(&RunFilter::new()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].span_count, 2);
    }

    #[tokio::test]
    async fn test_missing_run_and_delete() {
        let (service, run) = seeded().await;
        let missing = RunId::new();
        assert!(matches!(
            service.get_run(missing).await,
            Err(QueryError::NotFound(id)) if id == missing
        ));

        service.delete_run(run.id).await.unwrap();
        assert!(matches!(
            service.delete_run(run.id).await,
            Err(QueryError::NotFound(_))
        ));
        assert!(service.store().read_spans(&run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_diff_runs_validates_threshold() {
        let (service, run) = seeded().await;
        assert!(service.diff_runs(run.id, run.id, None).await.unwrap().is_empty());
        assert!(matches!(
            service.diff_runs(run.id, run.id, Some(-1.0)).await,
            Err(QueryError::InvalidThreshold(_))
        ));
    }

    #[tokio::test]
    async fn test_load_blob() {
        let (service, _) = seeded().await;
        assert!(matches!(
            service.load_blob("abc").await,
            Err(QueryError::NoBlobStore)
        ));

        let blobs = Arc::new(MemoryBlobStore::new());
        let key = crate::blob::content_key(b"payload");
        blobs.put(&key, b"payload".to_vec()).await.unwrap();
        let service = service.with_blob_store(blobs);
        assert_eq!(service.load_blob(&key).await.unwrap(), b"payload".to_vec());
        assert!(matches!(
            service.load_blob("missing").await,
            Err(QueryError::BlobNotFound(_))
        ));
    }
}
