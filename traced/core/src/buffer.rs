//! Bounded queue between instrumented calls and the background consumers.
//!
//! Every consumer class gets its own lane so that a slow persistence flush
//! never costs the broadcaster events, and the other way round. A push is a
//! short critical section with no I/O; when a lane is full its oldest event
//! is dropped and counted.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::Notify;
use traced_proto::prelude::{RunId, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerClass {
    Persistence,
    Broadcast,
}

impl ConsumerClass {
    pub const ALL: [ConsumerClass; 2] = [ConsumerClass::Persistence, ConsumerClass::Broadcast];

    fn index(self) -> usize {
        match self {
            ConsumerClass::Persistence => 0,
            ConsumerClass::Broadcast => 1,
        }
    }
}

/// A closed span on its way to the consumers. Lanes share the span.
#[derive(Debug, Clone)]
pub struct Event {
    pub run_id: RunId,
    pub span: Arc<Span>,
}

impl Event {
    pub fn seq(&self) -> u64 {
        self.span.seq
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub attached: bool,
    pub queued: usize,
    pub capacity: usize,
    pub dropped: u64,
    pub delivered: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub persistence: LaneStats,
    pub broadcast: LaneStats,
}

impl BufferStats {
    pub fn lane(&self, class: ConsumerClass) -> &LaneStats {
        match class {
            ConsumerClass::Persistence => &self.persistence,
            ConsumerClass::Broadcast => &self.broadcast,
        }
    }
}

/// Result of a successful [`EventBuffer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Close sequence number assigned to the span.
    pub seq: u64,
    /// Older events shed across all lanes to make room.
    pub dropped: u64,
}

#[derive(Debug)]
struct Lane {
    attached: bool,
    capacity: usize,
    wake_at: usize,
    queue: VecDeque<Event>,
    // Events queued or taken but not yet acknowledged, per run and seq.
    outstanding: HashMap<RunId, BTreeMap<u64, Arc<Span>>>,
    dropped: u64,
    delivered: u64,
}

impl Lane {
    fn new(capacity: usize) -> Self {
        Lane {
            attached: false,
            capacity: capacity.max(1),
            wake_at: 1,
            queue: VecDeque::new(),
            outstanding: HashMap::new(),
            dropped: 0,
            delivered: 0,
        }
    }

    fn hold(&mut self, event: &Event) {
        self.outstanding
            .entry(event.run_id)
            .or_default()
            .insert(event.seq(), event.span.clone());
    }

    fn release(&mut self, event: &Event) {
        if let Some(held) = self.outstanding.get_mut(&event.run_id) {
            held.remove(&event.seq());
            if held.is_empty() {
                self.outstanding.remove(&event.run_id);
            }
        }
    }

    /// Drops the oldest events beyond capacity. Returns how many.
    fn shed_overflow(&mut self) -> u64 {
        let mut shed = 0;
        while self.queue.len() > self.capacity {
            if let Some(old) = self.queue.pop_front() {
                self.release(&old);
                shed += 1;
            }
        }
        self.dropped += shed;
        shed
    }

    fn stats(&self) -> LaneStats {
        LaneStats {
            attached: self.attached,
            queued: self.queue.len(),
            capacity: self.capacity,
            dropped: self.dropped,
            delivered: self.delivered,
        }
    }
}

#[derive(Debug)]
struct Inner {
    lanes: [Lane; 2],
    next_seq: HashMap<RunId, u64>,
    // Runs that no longer accept events. Kept after `forget_run` so that a
    // late push can never restart a run's sequence.
    closed: HashSet<RunId>,
}

#[derive(Debug)]
pub struct EventBuffer {
    inner: Mutex<Inner>,
    notify: [Notify; 2],
}

impl EventBuffer {
    /// Creates a buffer whose lanes hold at most `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        EventBuffer {
            inner: Mutex::new(Inner {
                lanes: [Lane::new(capacity), Lane::new(capacity)],
                next_seq: HashMap::new(),
                closed: HashSet::new(),
            }),
            notify: [Notify::new(), Notify::new()],
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts queueing events for `class`. The consumer is woken once
    /// `wake_at` events are waiting.
    pub fn attach(&self, class: ConsumerClass, wake_at: usize) {
        let mut inner = self.lock();
        let lane = &mut inner.lanes[class.index()];
        lane.attached = true;
        lane.wake_at = wake_at.clamp(1, lane.capacity);
    }

    /// Stops queueing for `class` and discards what is waiting.
    pub fn detach(&self, class: ConsumerClass) {
        let mut inner = self.lock();
        let lane = &mut inner.lanes[class.index()];
        lane.attached = false;
        lane.queue.clear();
        lane.outstanding.clear();
    }

    pub fn is_attached(&self, class: ConsumerClass) -> bool {
        self.lock().lanes[class.index()].attached
    }

    /// Assigns the span its close sequence number and queues it on every
    /// attached lane. Returns `None` when the span's run is closed.
    pub fn push(&self, mut span: Span) -> Option<Enqueued> {
        let mut wake = [false; 2];
        let run_id = span.run_id;
        let enqueued = {
            let mut inner = self.lock();
            if inner.closed.contains(&run_id) {
                return None;
            }
            let next = inner.next_seq.entry(run_id).or_insert(0);
            *next += 1;
            span.seq = *next;
            let event = Event {
                run_id,
                span: Arc::new(span),
            };
            let mut dropped = 0;
            for class in ConsumerClass::ALL {
                let lane = &mut inner.lanes[class.index()];
                if !lane.attached {
                    continue;
                }
                lane.queue.push_back(event.clone());
                lane.hold(&event);
                dropped += lane.shed_overflow();
                wake[class.index()] = lane.queue.len() >= lane.wake_at;
            }
            Enqueued {
                seq: event.seq(),
                dropped,
            }
        };
        if enqueued.dropped > 0 {
            log::debug!(
                "event buffer full, shed {} events to queue span {} of run {run_id}",
                enqueued.dropped,
                enqueued.seq
            );
        }
        for class in ConsumerClass::ALL {
            if wake[class.index()] {
                self.notify[class.index()].notify_one();
            }
        }
        Some(enqueued)
    }

    /// Removes up to `max` events from the front of the lane, in push order.
    /// They stay outstanding until acknowledged.
    pub fn take(&self, class: ConsumerClass, max: usize) -> Vec<Event> {
        let mut inner = self.lock();
        let lane = &mut inner.lanes[class.index()];
        let n = max.min(lane.queue.len());
        lane.queue.drain(..n).collect()
    }

    /// Waits until the lane has events, then takes up to `max` of them.
    pub async fn recv(&self, class: ConsumerClass, max: usize) -> Vec<Event> {
        loop {
            let batch = self.take(class, max);
            if !batch.is_empty() {
                return batch;
            }
            self.notify[class.index()].notified().await;
        }
    }

    /// Resolves when the lane reaches its wake threshold.
    pub async fn wait(&self, class: ConsumerClass) {
        self.notify[class.index()].notified().await
    }

    /// Wakes the consumer of `class` regardless of the queue length.
    pub fn wake(&self, class: ConsumerClass) {
        self.notify[class.index()].notify_one();
    }

    /// Marks taken events as delivered.
    pub fn ack(&self, class: ConsumerClass, events: &[Event]) {
        let mut inner = self.lock();
        let lane = &mut inner.lanes[class.index()];
        for event in events {
            lane.release(event);
        }
        lane.delivered += events.len() as u64;
    }

    /// Puts taken events back at the front of the lane, keeping their order.
    /// Events that no longer fit are dropped oldest first.
    pub fn requeue(&self, class: ConsumerClass, events: Vec<Event>) {
        let shed = {
            let mut inner = self.lock();
            let lane = &mut inner.lanes[class.index()];
            if !lane.attached {
                for event in &events {
                    lane.release(event);
                }
                return;
            }
            for event in events.into_iter().rev() {
                lane.queue.push_front(event);
            }
            lane.shed_overflow()
        };
        if shed > 0 {
            log::debug!("event buffer full, shed {shed} requeued events from the {class:?} lane");
        }
    }

    /// Events of `run` queued or in flight on the lane.
    pub fn pending(&self, class: ConsumerClass, run: &RunId) -> usize {
        self.lock().lanes[class.index()]
            .outstanding
            .get(run)
            .map_or(0, BTreeMap::len)
    }

    /// Spans of `run` queued or in flight on the lane, in sequence order.
    pub fn outstanding(&self, class: ConsumerClass, run: &RunId) -> Vec<Arc<Span>> {
        self.lock().lanes[class.index()]
            .outstanding
            .get(run)
            .map(|held| held.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, class: ConsumerClass) -> usize {
        self.lock().lanes[class.index()].queue.len()
    }

    pub fn is_empty(&self, class: ConsumerClass) -> bool {
        self.len(class) == 0
    }

    /// Refuses every later push for `run`. Events already queued still
    /// reach their consumers.
    pub fn close_run(&self, run: &RunId) {
        self.lock().closed.insert(*run);
    }

    pub fn is_closed(&self, run: &RunId) -> bool {
        self.lock().closed.contains(run)
    }

    /// Drops the sequence counter of a closed run.
    pub fn forget_run(&self, run: &RunId) {
        let mut inner = self.lock();
        inner.closed.insert(*run);
        inner.next_seq.remove(run);
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.lock();
        BufferStats {
            persistence: inner.lanes[ConsumerClass::Persistence.index()].stats(),
            broadcast: inner.lanes[ConsumerClass::Broadcast.index()].stats(),
        }
    }
}
