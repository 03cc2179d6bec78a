use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use traced_core::{ConsumerClass, Event, EventBuffer, TraceStore};
use traced_proto::prelude::{DropReason, LiveMessage, Run, RunId, Span, Topic};

use super::LiveError;

#[derive(Debug)]
struct Observer {
    topic: Topic,
    tx: mpsc::Sender<LiveMessage>,
    reason: Arc<OnceLock<DropReason>>,
}

#[derive(Debug, Default)]
struct HubInner {
    observers: HashMap<u64, Observer>,
    // Recently published spans per active run, oldest first.
    tails: HashMap<RunId, VecDeque<Arc<Span>>>,
    shutdown: bool,
}

impl HubInner {
    /// Returns how many observers were dropped for being slow.
    fn fan_out(&mut self, run: &RunId, message: &LiveMessage) -> u64 {
        let mut slow = 0;
        self.observers.retain(|id, observer| {
            if !observer.topic.matches(run) {
                return !observer.tx.is_closed();
            }
            match observer.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    let _ = observer.reason.set(DropReason::SlowConsumer);
                    log::warn!("dropping live observer {id}: outbound queue full");
                    slow += 1;
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        slow
    }
}

/// Fan-out point between the broadcast lane and live observers.
///
/// Every observer owns a bounded queue. Publishing never waits: an observer
/// whose queue is full is disconnected and told why.
#[derive(Debug)]
pub struct Hub {
    inner: Mutex<HubInner>,
    store: Option<Arc<dyn TraceStore>>,
    buffer: Option<Arc<EventBuffer>>,
    queue_capacity: usize,
    tail_capacity: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl Hub {
    pub fn new(
        store: Option<Arc<dyn TraceStore>>,
        queue_capacity: usize,
        tail_capacity: usize,
    ) -> Self {
        Hub {
            inner: Mutex::new(HubInner::default()),
            store,
            buffer: None,
            queue_capacity: queue_capacity.max(1),
            tail_capacity,
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Lets backfill include spans still waiting on the persistence lane,
    /// so a span evicted from the tail before it is stored is not lost.
    pub fn with_buffer(mut self, buffer: Arc<EventBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    /// Observers disconnected so far because their queue was full.
    pub fn dropped_observers(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Registers an observer. With `backfill` the spans of the run recorded
    /// so far are collected for replay, and live spans already replayed are
    /// skipped by [`Subscription::next`].
    pub async fn subscribe(&self, topic: Topic, backfill: bool) -> Result<Subscription, LiveError> {
        let backfill_run = match (backfill, topic) {
            (false, _) => None,
            (true, Topic::Run(run)) => Some(run),
            (true, Topic::All) => return Err(LiveError::BackfillNeedsRun),
        };

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let reason = Arc::new(OnceLock::new());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Registration and the tail copy happen under one lock: every span
        // published before this point is in the tail, every later one is
        // delivered to the new queue.
        let tail: Vec<Arc<Span>> = {
            let mut inner = self.lock();
            if inner.shutdown {
                return Err(LiveError::ShuttingDown);
            }
            inner.observers.insert(
                id,
                Observer {
                    topic,
                    tx,
                    reason: reason.clone(),
                },
            );
            backfill_run
                .and_then(|run| inner.tails.get(&run))
                .map(|tail| tail.iter().cloned().collect())
                .unwrap_or_default()
        };
        log::debug!("live observer {id} subscribed to {topic:?} (backfill: {backfill})");

        let mut subscription = Subscription {
            id,
            topic,
            rx,
            reason,
            backfill: None,
        };
        if let Some(run) = backfill_run {
            match self.collect_backfill(run, tail).await {
                Ok(replay) => subscription.backfill = Some(replay),
                Err(e) => {
                    self.unsubscribe(id);
                    return Err(e);
                }
            }
        }
        Ok(subscription)
    }

    async fn collect_backfill(&self, run: RunId, tail: Vec<Arc<Span>>) -> Result<Backfill, LiveError> {
        let mut by_seq: BTreeMap<u64, Span> = BTreeMap::new();
        // Unstored spans are read before the store: an event leaves the
        // persistence lane only once written, so none falls in between.
        let unstored = self
            .buffer
            .as_ref()
            .map(|buffer| buffer.outstanding(ConsumerClass::Persistence, &run))
            .unwrap_or_default();
        if let Some(store) = &self.store {
            for span in store.read_spans(&run).await? {
                by_seq.insert(span.seq, span);
            }
        }
        for span in unstored.into_iter().chain(tail) {
            by_seq
                .entry(span.seq)
                .or_insert_with(|| span.as_ref().clone());
        }
        Ok(Backfill {
            run,
            replayed: by_seq.keys().copied().collect(),
            spans: by_seq.into_values().collect(),
            sent: false,
        })
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.lock().observers.remove(&id).is_some() {
            log::debug!("live observer {id} unsubscribed");
        }
    }

    /// Delivers a batch taken from the broadcast lane.
    pub fn publish(&self, events: &[Event]) {
        let mut inner = self.lock();
        if inner.shutdown {
            return;
        }
        for event in events {
            if self.tail_capacity > 0 {
                let tail = inner.tails.entry(event.run_id).or_default();
                tail.push_back(event.span.clone());
                while tail.len() > self.tail_capacity {
                    tail.pop_front();
                }
            }
            let message = LiveMessage::Span {
                span: event.span.as_ref().clone(),
            };
            let slow = inner.fan_out(&event.run_id, &message);
            self.dropped.fetch_add(slow, Ordering::Relaxed);
        }
    }

    pub fn publish_closed(&self, run: &Run) {
        let mut inner = self.lock();
        inner.tails.remove(&run.id);
        let slow = inner.fan_out(&run.id, &LiveMessage::RunClosed { run: run.clone() });
        self.dropped.fetch_add(slow, Ordering::Relaxed);
    }

    /// Drops the tails of runs for which `keep` is false. Returns how many
    /// were dropped.
    pub fn retain_tails(&self, keep: impl Fn(&RunId) -> bool) -> usize {
        let mut inner = self.lock();
        let before = inner.tails.len();
        inner.tails.retain(|run, _| keep(run));
        before - inner.tails.len()
    }

    /// Disconnects every observer with [`DropReason::Shutdown`] and refuses
    /// new ones.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.shutdown = true;
        for observer in inner.observers.values() {
            let _ = observer.reason.set(DropReason::Shutdown);
        }
        inner.observers.clear();
        inner.tails.clear();
    }
}

#[derive(Debug)]
struct Backfill {
    run: RunId,
    spans: Vec<Span>,
    replayed: HashSet<u64>,
    sent: bool,
}

/// One observer's view of the live stream.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::Receiver<LiveMessage>,
    reason: Arc<OnceLock<DropReason>>,
    backfill: Option<Backfill>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Recorded spans in sequence order followed by `BackfillComplete`.
    /// Empty without backfill or when called again.
    pub fn replay(&mut self) -> Vec<LiveMessage> {
        let Some(backfill) = self.backfill.as_mut() else {
            return Vec::new();
        };
        if backfill.sent {
            return Vec::new();
        }
        backfill.sent = true;
        let spans = std::mem::take(&mut backfill.spans);
        let count = spans.len();
        let last_seq = backfill.replayed.iter().max().copied();
        let mut messages: Vec<LiveMessage> = spans
            .into_iter()
            .map(|span| LiveMessage::Span { span })
            .collect();
        messages.push(LiveMessage::BackfillComplete {
            run_id: backfill.run,
            count,
            last_seq,
        });
        messages
    }

    /// Next live message. When the hub disconnects this observer, a final
    /// `Dropped` message carries the reason; `None` follows.
    pub async fn next(&mut self) -> Option<LiveMessage> {
        loop {
            match self.rx.recv().await {
                Some(LiveMessage::Span { span }) if self.already_replayed(&span) => continue,
                Some(message) => return Some(message),
                None => {
                    let reason = self.reason.get().copied()?;
                    // Reported once.
                    self.reason = Arc::new(OnceLock::new());
                    return Some(LiveMessage::Dropped { reason });
                }
            }
        }
    }

    fn already_replayed(&self, span: &Span) -> bool {
        self.backfill
            .as_ref()
            .is_some_and(|b| b.run == span.run_id && b.replayed.contains(&span.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use traced_core::store::SledStore;
    use traced_proto::prelude::{Outcome, Snapshot, SpanId, Timestamp};

    fn event(run: RunId, seq: u64) -> Event {
        Event {
            run_id: run,
            span: Arc::new(Span {
                id: SpanId(seq),
                run_id: run,
                parent_id: None,
                seq,
                name: "step".to_string(),
                thread_id: 1,
                start: Timestamp(seq * 10),
                end: Timestamp(seq * 10 + 5),
                args: Snapshot::nil(),
                outcome: Outcome::Returned(Snapshot::nil()),
                sampled: true,
            }),
        }
    }

    fn seq_of(message: &LiveMessage) -> Option<u64> {
        match message {
            LiveMessage::Span { span } => Some(span.seq),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_backfill_from_tail_then_live_without_duplicates() {
        let hub = Hub::new(None, 16, 16);
        let run = RunId::new();
        hub.publish(&[event(run, 1), event(run, 2)]);

        let mut sub = hub.subscribe(Topic::Run(run), true).await.unwrap();
        let replay = sub.replay();
        let seqs: Vec<_> = replay.iter().filter_map(seq_of).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(
            replay.last(),
            Some(&LiveMessage::BackfillComplete {
                run_id: run,
                count: 2,
                last_seq: Some(2)
            })
        );
        assert!(sub.replay().is_empty());

        hub.publish(&[event(run, 3)]);
        assert_eq!(sub.next().await.as_ref().and_then(seq_of), Some(3));
    }

    #[tokio::test]
    async fn test_backfill_covers_spans_evicted_from_tail_before_they_are_stored() {
        let buffer = Arc::new(EventBuffer::new(64));
        buffer.attach(ConsumerClass::Persistence, 64);
        let store: Arc<dyn TraceStore> = Arc::new(SledStore::temporary().unwrap());
        let hub = Hub::new(Some(store), 16, 2).with_buffer(buffer.clone());
        let run = RunId::new();

        let mut published = Vec::new();
        for seq in 1..=5 {
            let queued = buffer.push(event(run, seq).span.as_ref().clone()).unwrap();
            assert_eq!(queued.seq, seq);
            published.push(event(run, seq));
        }
        hub.publish(&published);

        let mut sub = hub.subscribe(Topic::Run(run), true).await.unwrap();
        let seqs: Vec<_> = sub.replay().iter().filter_map(seq_of).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        buffer.push(event(run, 6).span.as_ref().clone());
        hub.publish(&[event(run, 6)]);
        assert_eq!(sub.next().await.as_ref().and_then(seq_of), Some(6));
    }

    #[test]
    fn test_retain_tails_drops_runs_no_longer_active() {
        let hub = Hub::new(None, 4, 4);
        let (live, gone) = (RunId::new(), RunId::new());
        hub.publish(&[event(live, 1), event(gone, 1)]);
        assert_eq!(hub.retain_tails(|run| *run == live), 1);
        assert_eq!(hub.retain_tails(|run| *run == live), 0);
    }

    #[tokio::test]
    async fn test_topic_filtering() {
        let hub = Hub::new(None, 16, 0);
        let (mine, other) = (RunId::new(), RunId::new());
        let mut sub = hub.subscribe(Topic::Run(mine), false).await.unwrap();
        hub.publish(&[event(other, 1), event(mine, 1)]);
        match sub.next().await {
            Some(LiveMessage::Span { span }) => assert_eq!(span.run_id, mine),
            other => panic!("unexpected {other:?}"),
        }
        assert!(sub.replay().is_empty());
    }

    #[tokio::test]
    async fn test_slow_observer_is_dropped() {
        let hub = Hub::new(None, 2, 0);
        let run = RunId::new();
        let mut slow = hub.subscribe(Topic::All, false).await.unwrap();
        hub.publish(&[event(run, 1), event(run, 2), event(run, 3)]);
        assert_eq!(hub.observer_count(), 0);
        assert_eq!(hub.dropped_observers(), 1);

        assert_eq!(slow.next().await.as_ref().and_then(seq_of), Some(1));
        assert_eq!(slow.next().await.as_ref().and_then(seq_of), Some(2));
        assert_eq!(
            slow.next().await,
            Some(LiveMessage::Dropped {
                reason: DropReason::SlowConsumer
            })
        );
        assert_eq!(slow.next().await, None);
    }

    #[tokio::test]
    async fn test_backfill_requires_run_topic() {
        let hub = Hub::new(None, 4, 4);
        assert!(matches!(
            hub.subscribe(Topic::All, true).await,
            Err(LiveError::BackfillNeedsRun)
        ));
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_notifies_observers() {
        let hub = Hub::new(None, 4, 4);
        let mut sub = hub.subscribe(Topic::All, false).await.unwrap();
        hub.shutdown();
        assert_eq!(
            sub.next().await,
            Some(LiveMessage::Dropped {
                reason: DropReason::Shutdown
            })
        );
        assert!(matches!(
            hub.subscribe(Topic::All, false).await,
            Err(LiveError::ShuttingDown)
        ));
    }
}
