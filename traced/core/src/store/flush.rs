//! Background task moving closed spans from the event buffer into a store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use traced_proto::prelude::{Outcome, RunId, Snapshot, Span, Timestamp};

use super::{with_retry, StoreError, TraceStore};
use crate::blob::{content_key, BlobStore};
use crate::buffer::{ConsumerClass, Event, EventBuffer};
use crate::config::{RetryPolicy, TracerConfig};
use crate::tracer::RunRegistry;

/// Raised on the operator channel when a batch could not be persisted
/// after every retry. The batch stays queued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistenceAlert {
    pub run_id: RunId,
    pub events: usize,
    pub error: String,
    pub at: Timestamp,
}

/// Signals from the tracer to a running flusher.
#[derive(Debug, Default)]
pub struct FlushControl {
    kick: Notify,
    stop: Notify,
    stopping: AtomicBool,
}

impl FlushControl {
    /// Requests a flush now instead of at the next tick.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Requests a final flush followed by exit.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop.notify_one();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: bool,
}

pub struct Flusher {
    store: Arc<dyn TraceStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    buffer: Arc<EventBuffer>,
    runs: Arc<RunRegistry>,
    batch_size: usize,
    interval: Duration,
    inline_threshold: usize,
    retry: RetryPolicy,
    alerts: broadcast::Sender<PersistenceAlert>,
    control: Arc<FlushControl>,
}

impl Flusher {
    pub fn new(
        store: Arc<dyn TraceStore>,
        buffer: Arc<EventBuffer>,
        runs: Arc<RunRegistry>,
        config: &TracerConfig,
        alerts: broadcast::Sender<PersistenceAlert>,
        control: Arc<FlushControl>,
    ) -> Self {
        Flusher {
            store,
            blobs: None,
            buffer,
            runs,
            batch_size: config.flush_batch_size.max(1),
            interval: config.flush_interval(),
            inline_threshold: config.inline_threshold_bytes,
            retry: config.retry.clone(),
            alerts,
            control,
        }
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Flushes whenever the lane reaches the batch size, the interval
    /// elapses, or the tracer asks; exits after a final flush on stop.
    pub async fn run(self) {
        log::debug!(
            "flusher started: {} engine, batch {}, interval {:?}",
            self.store.engine().as_str(),
            self.batch_size,
            self.interval
        );
        loop {
            tokio::select! {
                _ = self.buffer.wait(ConsumerClass::Persistence) => {}
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.control.kick.notified() => {}
                _ = self.control.stop.notified() => {}
            }
            self.flush_pending().await;
            if self.control.is_stopping() {
                break;
            }
        }
        let left = self.buffer.len(ConsumerClass::Persistence);
        if left > 0 {
            log::warn!("flusher stopped with {left} events unpersisted");
        } else {
            log::debug!("flusher stopped");
        }
    }

    /// Writes batches until the lane is empty or a batch fails.
    pub async fn flush_pending(&self) -> FlushReport {
        let mut report = FlushReport::default();
        loop {
            match self.flush_once().await {
                Ok(0) => break,
                Ok(n) => report.written += n,
                Err(_) => {
                    report.failed = true;
                    break;
                }
            }
        }
        report
    }

    /// Writes one batch of at most `batch_size` events. On failure the
    /// unwritten events go back to the front of the lane.
    pub async fn flush_once(&self) -> Result<usize, StoreError> {
        let events = self.buffer.take(ConsumerClass::Persistence, self.batch_size);
        if events.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut groups = group_by_run(events).into_iter();
        while let Some((run_id, group)) = groups.next() {
            match self.write_group(&run_id, &group).await {
                Ok(()) => {
                    self.buffer.ack(ConsumerClass::Persistence, &group);
                    written += group.len();
                }
                Err(e) => {
                    let mut unwritten = group;
                    for (_, rest) in groups {
                        unwritten.extend(rest);
                    }
                    log::error!(
                        "persisting {} spans of run {run_id} failed after {} attempts: {e}",
                        unwritten.len(),
                        self.retry.max_attempts
                    );
                    let _ = self.alerts.send(PersistenceAlert {
                        run_id,
                        events: unwritten.len(),
                        error: e.to_string(),
                        at: Timestamp::now(),
                    });
                    self.buffer.requeue(ConsumerClass::Persistence, unwritten);
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    async fn write_group(&self, run_id: &RunId, group: &[Event]) -> Result<(), StoreError> {
        let mut spans = Vec::with_capacity(group.len());
        for event in group {
            spans.push(self.offload(event.span.as_ref().clone()).await);
        }
        let run = self.runs.snapshot(run_id);

        with_retry(&self.retry, "span batch write", || async {
            if let Some(run) = &run {
                self.store.write_run(run).await?;
            }
            self.store.write_spans(run_id, &spans).await
        })
        .await?;
        log::debug!("persisted {} spans of run {run_id}", spans.len());
        Ok(())
    }

    async fn offload(&self, mut span: Span) -> Span {
        let Some(blobs) = &self.blobs else {
            return span;
        };
        span.args = self.offload_snapshot(blobs.as_ref(), span.args).await;
        if let Outcome::Returned(result) = span.outcome {
            span.outcome = Outcome::Returned(self.offload_snapshot(blobs.as_ref(), result).await);
        }
        span
    }

    async fn offload_snapshot(&self, blobs: &dyn BlobStore, snapshot: Snapshot) -> Snapshot {
        let value = match snapshot {
            Snapshot::Inline(value) if value.encoded_len() > self.inline_threshold => value,
            other => return other,
        };
        let bytes = value.to_string().into_bytes();
        let len = bytes.len() as u64;
        match blobs.put(&content_key(&bytes), bytes).await {
            Ok(key) => Snapshot::Blob { key, bytes: len },
            Err(e) => {
                log::warn!("blob store rejected a {len} byte snapshot, keeping it inline: {e}");
                Snapshot::Inline(value)
            }
        }
    }
}

/// Splits a batch per run, keeping the order of events within each run.
fn group_by_run(events: Vec<Event>) -> Vec<(RunId, Vec<Event>)> {
    let mut groups: Vec<(RunId, Vec<Event>)> = Vec::new();
    for event in events {
        match groups.iter_mut().find(|(run, _)| *run == event.run_id) {
            Some((_, group)) => group.push(event),
            None => groups.push((event.run_id, vec![event])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use traced_proto::prelude::{Run, RunFilter, RunSummary, SpanId, Value};

    use crate::blob::MemoryBlobStore;
    use crate::store::{Engine, SledStore};

    /// Delegates to sled but fails the first `failures` span writes.
    #[derive(Debug)]
    struct FlakyStore {
        inner: SledStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl TraceStore for FlakyStore {
        fn engine(&self) -> Engine {
            Engine::Sled
        }

        async fn write_run(&self, run: &Run) -> Result<(), StoreError> {
            self.inner.write_run(run).await
        }

        async fn write_spans(&self, run_id: &RunId, spans: &[Span]) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.write_spans(run_id, spans).await
        }

        async fn read_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
            self.inner.read_run(run_id).await
        }

        async fn read_spans(&self, run_id: &RunId) -> Result<Vec<Span>, StoreError> {
            self.inner.read_spans(run_id).await
        }

        async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
            self.inner.list_runs(filter).await
        }

        async fn delete_run(&self, run_id: &RunId) -> Result<bool, StoreError> {
            self.inner.delete_run(run_id).await
        }
    }

    fn span(run: RunId, id: u64, args: Value) -> Span {
        Span {
            id: SpanId(id),
            run_id: run,
            parent_id: None,
            seq: 0,
            name: "step".to_string(),
            thread_id: 1,
            start: Timestamp(id),
            end: Timestamp(id + 10),
            args: Snapshot::Inline(args),
            outcome: Outcome::Returned(Snapshot::nil()),
            sampled: true,
        }
    }

    struct Fixture {
        store: Arc<FlakyStore>,
        buffer: Arc<EventBuffer>,
        runs: Arc<RunRegistry>,
        alerts: broadcast::Receiver<PersistenceAlert>,
        flusher: Flusher,
        run: Run,
    }

    fn fixture(failures: u32, max_attempts: u32) -> Fixture {
        let store = Arc::new(FlakyStore {
            inner: SledStore::temporary().unwrap(),
            failures: AtomicU32::new(failures),
        });
        let buffer = Arc::new(EventBuffer::new(64));
        buffer.attach(ConsumerClass::Persistence, 4);
        let runs = Arc::new(RunRegistry::default());
        let run = Run::new("flush", BTreeMap::new());
        runs.insert(run.clone(), None);
        let config = TracerConfig {
            flush_batch_size: 4,
            inline_threshold_bytes: 64,
            retry: RetryPolicy {
                max_attempts,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            ..TracerConfig::default()
        };
        let (tx, rx) = broadcast::channel(8);
        let flusher = Flusher::new(
            store.clone(),
            buffer.clone(),
            runs.clone(),
            &config,
            tx,
            Arc::new(FlushControl::default()),
        );
        Fixture {
            store,
            buffer,
            runs,
            alerts: rx,
            flusher,
            run,
        }
    }

    #[tokio::test]
    async fn test_flush_writes_run_and_spans_in_order() {
        let f = fixture(0, 3);
        for id in 1..=6 {
            f.buffer.push(span(f.run.id, id, Value::Int(id as i64)));
        }
        let report = f.flusher.flush_pending().await;
        assert_eq!(report.written, 6);
        assert!(!report.failed);

        let stored = f.store.read_spans(&f.run.id).await.unwrap();
        assert_eq!(stored.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
        assert!(f.store.read_run(&f.run.id).await.unwrap().is_some());
        assert_eq!(f.buffer.pending(ConsumerClass::Persistence, &f.run.id), 0);
        assert!(f.runs.get(&f.run.id).is_some());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture(2, 5);
        f.buffer.push(span(f.run.id, 1, Value::Nil));
        assert_eq!(f.flusher.flush_once().await.unwrap(), 1);
        assert_eq!(f.store.read_spans(&f.run.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_requeue_and_alert() {
        let mut f = fixture(10, 2);
        for id in 1..=3 {
            f.buffer.push(span(f.run.id, id, Value::Nil));
        }
        assert!(f.flusher.flush_once().await.is_err());

        let alert = f.alerts.try_recv().unwrap();
        assert_eq!(alert.run_id, f.run.id);
        assert_eq!(alert.events, 3);
        assert_eq!(f.buffer.len(ConsumerClass::Persistence), 3);
        assert_eq!(f.buffer.pending(ConsumerClass::Persistence, &f.run.id), 3);
        assert!(f.store.read_spans(&f.run.id).await.unwrap().is_empty());

        f.store.failures.store(0, Ordering::SeqCst);
        assert_eq!(f.flusher.flush_pending().await.written, 3);
        let seqs: Vec<_> = f
            .store
            .read_spans(&f.run.id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_large_snapshots_move_to_blob_store() {
        let f = fixture(0, 1);
        let blobs = Arc::new(MemoryBlobStore::new());
        let flusher = f.flusher.with_blob_store(blobs.clone());
        let big = Value::Text("x".repeat(500));
        f.buffer.push(span(f.run.id, 1, big.clone()));
        f.buffer.push(span(f.run.id, 2, Value::Int(1)));
        flusher.flush_pending().await;

        let stored = f.store.read_spans(&f.run.id).await.unwrap();
        let Snapshot::Blob { key, bytes } = &stored[0].args else {
            panic!("expected blob, got {:?}", stored[0].args);
        };
        assert_eq!(*bytes, big.encoded_len() as u64);
        assert_eq!(blobs.get(key).await.unwrap(), Some(big.to_string().into_bytes()));
        assert!(matches!(stored[1].args, Snapshot::Inline(Value::Int(1))));
    }

    #[test]
    fn test_grouping_keeps_per_run_order() {
        let a = RunId::new();
        let b = RunId::new();
        let buffer = EventBuffer::new(16);
        buffer.attach(ConsumerClass::Persistence, 1);
        for (run, id) in [(a, 1), (b, 2), (a, 3), (b, 4)] {
            buffer.push(span(run, id, Value::Nil));
        }
        let groups = group_by_run(buffer.take(ConsumerClass::Persistence, 16));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, a);
        let ids: Vec<_> = groups[0].1.iter().map(|e| e.span.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
