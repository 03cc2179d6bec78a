//! Live span streaming.
//!
//! The [`Broadcaster`] attaches to the broadcast lane of a tracer's event
//! buffer and pumps every closed span into the [`Hub`], which fans it out
//! to subscribed observers. Run closures reach observers after the last
//! span of the run.

mod hub;
pub mod ws;

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use traced_core::{ConsumerClass, EventBuffer, RunRegistry, StoreError, Tracer};
use traced_proto::prelude::{Run, Topic};

pub use hub::{Hub, Subscription};

const PUMP_BATCH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("backfill requires a run topic")]
    BackfillNeedsRun,

    #[error("live broadcaster is shutting down")]
    ShuttingDown,

    #[error("no tokio runtime: {0}")]
    NoRuntime(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub struct Broadcaster {
    hub: Arc<Hub>,
    stop: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    /// Attaches to `tracer` and starts pumping on the current runtime.
    pub fn spawn(tracer: &Tracer) -> Result<Arc<Self>, LiveError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LiveError::NoRuntime(e.to_string()))?;
        let config = tracer.config();
        let buffer = tracer.buffer();
        let hub = Arc::new(
            Hub::new(
                tracer.store(),
                config.observer_queue_capacity,
                config.backfill_tail_capacity,
            )
            .with_buffer(buffer.clone()),
        );
        buffer.attach(ConsumerClass::Broadcast, 1);

        let stop = Arc::new(Notify::new());
        let task = runtime.spawn(pump(
            hub.clone(),
            buffer,
            tracer.closed_runs(),
            tracer.active_runs(),
            stop.clone(),
        ));
        log::info!("live broadcaster started");
        Ok(Arc::new(Broadcaster {
            hub,
            stop,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub async fn subscribe(&self, topic: Topic, backfill: bool) -> Result<Subscription, LiveError> {
        self.hub.subscribe(topic, backfill).await
    }

    /// Detaches from the buffer and disconnects every observer.
    pub async fn stop(&self) {
        self.stop.notify_one();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("live broadcaster task failed: {e}");
            }
        }
    }
}

async fn pump(
    hub: Arc<Hub>,
    buffer: Arc<EventBuffer>,
    mut closed: broadcast::Receiver<Run>,
    active: Arc<RunRegistry>,
    stop: Arc<Notify>,
) {
    let mut closed_open = true;
    loop {
        tokio::select! {
            batch = buffer.recv(ConsumerClass::Broadcast, PUMP_BATCH) => {
                hub.publish(&batch);
                buffer.ack(ConsumerClass::Broadcast, &batch);
            }
            run = closed.recv(), if closed_open => match run {
                Ok(run) => hub.publish_closed(&run),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    let stale = hub.retain_tails(|run| active.contains(run));
                    log::warn!(
                        "live broadcaster missed {n} run closures, dropped {stale} stale tails"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => closed_open = false,
            },
            _ = stop.notified() => break,
        }
    }
    buffer.detach(ConsumerClass::Broadcast);
    hub.shutdown();
    log::info!("live broadcaster stopped");
}
