use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use traced_proto::prelude::{Run, RunFilter, RunId, RunStatus, Snapshot, Span, Timestamp};

use crate::blob::{BlobStore, SledBlobStore};
use crate::buffer::{BufferStats, ConsumerClass, EventBuffer};
use crate::config::TracerConfig;
use crate::instrument::{self, InFlight, Instrumented, WrapOptions};
use crate::store::{
    open_store, with_retry, FlushControl, Flusher, PersistenceAlert, TraceStore,
};
use crate::trace::sampler::process_seed;
use crate::trace::snapshot::{capture, Capture};
use crate::trace::stack;
use crate::trace::{ActiveSpan, BernoulliSampler, CallSite, Decision, Sampler, TraceError};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CHANNEL_CAPACITY: usize = 64;

/// Parameters of a new run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub name: String,
    pub metadata: BTreeMap<String, String>,
    pub tags: Vec<String>,
    /// Seeds a sampler private to this run.
    pub seed: Option<u64>,
    /// Sampling rate for this run, overriding the tracer's.
    pub sample_rate: Option<f64>,
}

impl RunOptions {
    pub fn new<N: Into<String>>(name: N) -> Self {
        RunOptions {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tag<T: Into<String>>(mut self, tag: T) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = Some(rate);
        self
    }
}

/// In-memory state of an active run.
#[derive(Debug)]
pub struct RunState {
    run: Mutex<Run>,
    closing: AtomicBool,
    sampler: Option<Arc<dyn Sampler>>,
}

impl RunState {
    pub fn snapshot(&self) -> Run {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Returns `false` when the run was already closing.
    fn begin_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    fn close(&self, status: RunStatus) -> Run {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        run.status = status;
        run.ended_at = Some(Timestamp::now());
        run.clone()
    }
}

/// Active runs of one tracer, shared with the flusher.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, Arc<RunState>>>,
}

impl RunRegistry {
    pub fn insert(&self, run: Run, sampler: Option<Arc<dyn Sampler>>) -> Arc<RunState> {
        let state = Arc::new(RunState {
            run: Mutex::new(run),
            closing: AtomicBool::new(false),
            sampler,
        });
        let id = state.snapshot().id;
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, state.clone());
        state
    }

    pub fn get(&self, id: &RunId) -> Option<Arc<RunState>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &RunId) -> Option<Arc<RunState>> {
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn contains(&self, id: &RunId) -> bool {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Current record of an active run.
    pub fn snapshot(&self, id: &RunId) -> Option<Run> {
        self.get(id).map(|state| state.snapshot())
    }

    pub fn len(&self) -> usize {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Counters {
    unsampled: AtomicU64,
    late: AtomicU64,
    snapshot_failures: AtomicU64,
}

/// Loss and overhead counters. Dropped events are never an error, only a
/// number in here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TracerStats {
    pub unsampled_calls: u64,
    /// Spans that closed after their run started closing.
    pub late_events: u64,
    pub snapshot_failures: u64,
    pub active_runs: usize,
    pub buffer: BufferStats,
}

/// Scopes a run to the current thread until dropped.
#[derive(Debug)]
pub struct RunGuard {
    previous: Option<Option<RunId>>,
    _not_send: PhantomData<*const ()>,
}

impl RunGuard {
    fn new(run: RunId) -> Self {
        RunGuard {
            previous: stack::with_current(|s| s.set_current_run(Some(run))),
            _not_send: PhantomData,
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            stack::with_current(|s| s.set_current_run(previous));
        }
    }
}

struct TracerInner {
    config: TracerConfig,
    sampler: Arc<dyn Sampler>,
    buffer: Arc<EventBuffer>,
    runs: Arc<RunRegistry>,
    default_run: RwLock<Option<RunId>>,
    // Latest version handed out per run name.
    versions: Mutex<HashMap<String, u64>>,
    counters: Counters,
    store: Option<Arc<dyn TraceStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
    flush: Arc<FlushControl>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    alerts: broadcast::Sender<PersistenceAlert>,
    closed: broadcast::Sender<Run>,
}

impl Drop for TracerInner {
    fn drop(&mut self) {
        self.flush.stop();
    }
}

/// Owns sampling, buffering and run lifecycle for one traced process.
///
/// Cloning is cheap; clones share all state. Several tracers can coexist in
/// one process (tests build one each).
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("config", &self.inner.config)
            .field("active_runs", &self.inner.runs.len())
            .finish()
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Tracer::builder().build()
    }
}

impl Tracer {
    pub fn builder() -> TracerBuilder {
        TracerBuilder::new()
    }

    pub fn new(config: TracerConfig) -> Self {
        Tracer::builder().with_config(config).build()
    }

    /// Builds a tracer from `config`, opening the stores named by
    /// `store_url` and `blob_path` when they are set.
    pub async fn connect(config: TracerConfig) -> Result<Tracer, TraceError> {
        let mut builder = Tracer::builder().with_config(config.clone());
        let mut known = Vec::new();
        if let Some(url) = &config.store_url {
            let store = open_store(url).await?;
            known = store.list_runs(&RunFilter::new()).await?;
            builder = builder.with_store(store);
        }
        if let Some(path) = &config.blob_path {
            builder = builder.with_blob_store(Arc::new(SledBlobStore::open_path(path)?));
        }
        let tracer = builder.build();
        tracer.note_versions(known.iter().map(|run| (run.name.as_str(), run.version)));
        Ok(tracer)
    }

    /// Makes later runs of each name start above the given versions.
    pub fn note_versions<'a>(&self, seen: impl IntoIterator<Item = (&'a str, u64)>) {
        let mut versions = self
            .inner
            .versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (name, version) in seen {
            let latest = versions.entry(name.to_string()).or_insert(0);
            *latest = (*latest).max(version);
        }
    }

    fn next_version(&self, name: &str) -> u64 {
        let mut versions = self
            .inner
            .versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let latest = versions.entry(name.to_string()).or_insert(0);
        *latest += 1;
        *latest
    }

    pub fn config(&self) -> &TracerConfig {
        &self.inner.config
    }

    pub fn buffer(&self) -> Arc<EventBuffer> {
        self.inner.buffer.clone()
    }

    /// Runs that have started and not yet ended.
    pub fn active_runs(&self) -> Arc<RunRegistry> {
        self.inner.runs.clone()
    }

    pub fn store(&self) -> Option<Arc<dyn TraceStore>> {
        self.inner.store.clone()
    }

    pub fn blob_store(&self) -> Option<Arc<dyn BlobStore>> {
        self.inner.blobs.clone()
    }

    /// Starts the persistence flusher on the current tokio runtime.
    ///
    /// Without a store this does nothing. Calling it twice is harmless.
    pub fn spawn_background(&self) -> Result<(), TraceError> {
        let Some(store) = self.inner.store.clone() else {
            return Ok(());
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TraceError::NoRuntime(e.to_string()))?;
        let mut slot = self
            .inner
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let config = &self.inner.config;
        self.inner
            .buffer
            .attach(ConsumerClass::Persistence, config.flush_batch_size);
        let mut flusher = Flusher::new(
            store,
            self.inner.buffer.clone(),
            self.inner.runs.clone(),
            config,
            self.inner.alerts.clone(),
            self.inner.flush.clone(),
        );
        if let Some(blobs) = &self.inner.blobs {
            flusher = flusher.with_blob_store(blobs.clone());
        }
        *slot = Some(runtime.spawn(flusher.run()));
        Ok(())
    }

    /// Starts a run. The first run started becomes the default run, which
    /// instrumented calls use when no run is scoped to them.
    pub fn start_run<N: Into<String>>(&self, name: N, metadata: BTreeMap<String, String>) -> RunId {
        self.start_run_with(RunOptions {
            name: name.into(),
            metadata,
            ..Default::default()
        })
    }

    pub fn start_run_with(&self, options: RunOptions) -> RunId {
        let sampler: Option<Arc<dyn Sampler>> =
            if options.seed.is_some() || options.sample_rate.is_some() {
                Some(Arc::new(BernoulliSampler::with_seed(
                    options.sample_rate.unwrap_or(self.inner.config.sample_rate),
                    options
                        .seed
                        .or(self.inner.config.seed)
                        .unwrap_or_else(process_seed),
                )))
            } else {
                None
            };
        let mut run = Run::new(options.name, options.metadata);
        run.version = self.next_version(&run.name);
        run.tags = options.tags;
        let id = run.id;
        log::info!("run {id} ({} v{}) started", run.name, run.version);
        self.inner.runs.insert(run, sampler);

        let mut default = self
            .inner
            .default_run
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if default.is_none() {
            *default = Some(id);
        }
        id
    }

    pub fn default_run(&self) -> Option<RunId> {
        *self
            .inner
            .default_run
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_default_run(&self, run: Option<RunId>) {
        *self
            .inner
            .default_run
            .write()
            .unwrap_or_else(PoisonError::into_inner) = run;
    }

    /// The current record of an active run.
    pub fn run(&self, id: &RunId) -> Option<Run> {
        self.inner.runs.snapshot(id)
    }

    /// Scopes `run` to the current thread until the guard drops.
    pub fn enter(&self, run: RunId) -> RunGuard {
        RunGuard::new(run)
    }

    /// Scopes `run` to `fut`, on whatever thread polls it.
    pub fn in_run<F: Future>(&self, run: RunId, fut: F) -> impl Future<Output = F::Output> {
        async move {
            let mut fut = std::pin::pin!(fut);
            std::future::poll_fn(|cx| {
                let _scope = RunGuard::new(run);
                fut.as_mut().poll(cx)
            })
            .await
        }
    }

    /// Ends a run: later spans are discarded, queued ones are given up to
    /// the drain timeout to reach every attached consumer, then the run is
    /// marked with `status` and written.
    pub async fn end_run(&self, run_id: RunId, status: RunStatus) -> Result<Run, TraceError> {
        let state = self
            .inner
            .runs
            .get(&run_id)
            .ok_or(TraceError::UnknownRun(run_id))?;
        if !state.begin_closing() {
            return Err(TraceError::RunClosed(run_id));
        }
        self.inner.buffer.close_run(&run_id);
        {
            let mut default = self
                .inner
                .default_run
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *default == Some(run_id) {
                *default = None;
            }
        }

        let undelivered = self.drain(&run_id).await;
        if undelivered > 0 {
            log::warn!(
                "run {run_id}: {undelivered} events still undelivered after {:?}, closing anyway",
                self.inner.config.drain_timeout()
            );
        }

        let status = match status {
            RunStatus::Active => RunStatus::Completed,
            other => other,
        };
        let run = state.close(status);
        self.inner.runs.remove(&run_id);
        self.inner.buffer.forget_run(&run_id);

        if let Some(store) = &self.inner.store {
            let written = with_retry(&self.inner.config.retry, "run close write", || {
                store.write_run(&run)
            })
            .await;
            if let Err(e) = written {
                log::error!("run {run_id} closed but its final record was not persisted: {e}");
                let _ = self.inner.alerts.send(PersistenceAlert {
                    run_id,
                    events: 0,
                    error: e.to_string(),
                    at: Timestamp::now(),
                });
                return Err(e.into());
            }
        }

        let _ = self.inner.closed.send(run.clone());
        log::info!(
            "run {run_id} ({}) {} after {:?}",
            run.name,
            run.status,
            run.duration().unwrap_or_default()
        );
        Ok(run)
    }

    async fn drain(&self, run_id: &RunId) -> usize {
        let deadline = tokio::time::Instant::now() + self.inner.config.drain_timeout();
        loop {
            let pending: usize = ConsumerClass::ALL
                .iter()
                .map(|class| self.inner.buffer.pending(*class, run_id))
                .sum();
            if pending == 0 || tokio::time::Instant::now() >= deadline {
                return pending;
            }
            self.inner.flush.kick();
            self.inner.buffer.wake(ConsumerClass::Broadcast);
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Wraps `func` so that calls to it are traced.
    pub fn instrument<N, F>(&self, name: N, func: F) -> Instrumented<F>
    where
        N: Into<String>,
    {
        self.instrument_with(name, WrapOptions::default(), func)
    }

    pub fn instrument_with<N, F>(&self, name: N, options: WrapOptions, func: F) -> Instrumented<F>
    where
        N: Into<String>,
    {
        Instrumented::new(self.clone(), name.into(), options, func)
    }

    /// Traces one call of `func` without building a wrapper; convenient for
    /// recursive functions.
    pub fn trace<A, R, F>(&self, name: &str, options: &WrapOptions, args: A, func: F) -> R
    where
        A: Capture,
        R: Capture,
        F: FnOnce(A) -> R,
    {
        instrument::trace_call(self, name, options, args, func)
    }

    pub fn stats(&self) -> TracerStats {
        let counters = &self.inner.counters;
        TracerStats {
            unsampled_calls: counters.unsampled.load(Ordering::Relaxed),
            late_events: counters.late.load(Ordering::Relaxed),
            snapshot_failures: counters.snapshot_failures.load(Ordering::Relaxed),
            active_runs: self.inner.runs.len(),
            buffer: self.inner.buffer.stats(),
        }
    }

    /// Operator channel for batches that could not be persisted.
    pub fn alerts(&self) -> broadcast::Receiver<PersistenceAlert> {
        self.inner.alerts.subscribe()
    }

    /// Every run this tracer closes, as closed.
    pub fn closed_runs(&self) -> broadcast::Receiver<Run> {
        self.inner.closed.subscribe()
    }

    /// Stops the flusher after a final flush.
    pub async fn shutdown(&self) {
        self.inner.flush.stop();
        let handle = self
            .inner
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let timeout = self.inner.config.drain_timeout();
            if tokio::time::timeout(timeout, handle).await.is_err() {
                log::warn!("flusher did not stop within {timeout:?}");
            }
        }
    }

    /// Decides whether the current call is traced and, if so, opens its span.
    pub(crate) fn begin<A: Capture + ?Sized>(
        &self,
        name: &str,
        options: &WrapOptions,
        args: &A,
    ) -> Option<InFlight> {
        let (run_id, depth, parent) = stack::with_current(|s| {
            let run_id = s.current_run().or_else(|| self.default_run())?;
            Some((run_id, s.depth(), s.parent_for(&run_id)))
        })
        .flatten()?;
        let state = self.inner.runs.get(&run_id)?;
        if state.is_closing() {
            return None;
        }

        let site = CallSite {
            name,
            depth,
            always_trace: options.always_trace,
            rate: options.sample_rate,
        };
        let sampler = state.sampler.as_ref().unwrap_or(&self.inner.sampler);
        let sampled = match sampler.decide(&site) {
            Decision::Skip => {
                self.inner.counters.unsampled.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Decision::Sample { .. } => true,
            Decision::Forced => false,
        };

        let max_payload_bytes = self.max_payload_bytes(options);
        let args = capture(args, max_payload_bytes);
        self.note_snapshot(&args);
        Some(InFlight::new(
            self.clone(),
            ActiveSpan::open(run_id, parent, name, args, sampled),
            max_payload_bytes,
        ))
    }

    /// Hands a closed span to the buffer, unless its run is closing.
    ///
    /// The buffer refuses spans of closed runs under its own lock, so a span
    /// racing `end_run` is either drained with the run or counted late.
    pub(crate) fn complete(&self, span: Span) {
        let (id, run_id) = (span.id, span.run_id);
        let name = span.name.clone();
        if self.inner.buffer.push(span).is_none() {
            self.inner.counters.late.fetch_add(1, Ordering::Relaxed);
            log::debug!("discarding span {id} ({name}) of closed run {run_id}");
        }
    }

    pub(crate) fn note_snapshot(&self, snapshot: &Snapshot) {
        if matches!(snapshot, Snapshot::Unserializable { .. }) {
            self.inner
                .counters
                .snapshot_failures
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn max_payload_bytes(&self, options: &WrapOptions) -> usize {
        options
            .max_payload_bytes
            .unwrap_or(self.inner.config.max_payload_bytes)
    }
}

pub struct TracerBuilder {
    config: TracerConfig,
    sampler: Option<Arc<dyn Sampler>>,
    store: Option<Arc<dyn TraceStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
}

impl TracerBuilder {
    pub fn new() -> Self {
        TracerBuilder {
            config: TracerConfig::default(),
            sampler: None,
            store: None,
            blobs: None,
        }
    }

    pub fn with_config(mut self, config: TracerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TraceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn build(self) -> Tracer {
        let config = self.config;
        let sampler = self.sampler.unwrap_or_else(|| {
            Arc::new(BernoulliSampler::with_seed(
                config.sample_rate,
                config.seed.unwrap_or_else(process_seed),
            ))
        });
        let (alerts, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (closed, _) = broadcast::channel(CHANNEL_CAPACITY);
        Tracer {
            inner: Arc::new(TracerInner {
                buffer: Arc::new(EventBuffer::new(config.buffer_capacity)),
                config,
                sampler,
                runs: Arc::new(RunRegistry::default()),
                default_run: RwLock::new(None),
                versions: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                store: self.store,
                blobs: self.blobs,
                flush: Arc::new(FlushControl::default()),
                flusher: Mutex::new(None),
                alerts,
                closed,
            }),
        }
    }
}

impl Default for TracerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
