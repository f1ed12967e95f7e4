use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use asyncq_protocol::message::Delivery;
use asyncq_protocol::Frame;

use crate::metrics::BrokerMetrics;

/// A message held by a queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: Vec<u8>,
    pub priority: u8,
    pub redelivered: bool,
}

/// Heap entry for ready messages: higher priority first, FIFO within a
/// priority class via the monotonically increasing sequence number.
struct ReadyEntry {
    priority: u8,
    seq: u64,
    message: QueuedMessage,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

/// Heap entry for messages held back by an eta. `BinaryHeap` is a
/// max-heap, so the ordering is reversed to pop the soonest due date.
struct DelayedEntry {
    due: DateTime<Utc>,
    seq: u64,
    message: QueuedMessage,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

/// One registered consumer of a queue.
///
/// `outstanding` counts unacknowledged deliveries against `prefetch`;
/// `next_tag` and `unacked` are shared with the owning connection so
/// delivery tags stay unique per connection across queues.
#[derive(Clone)]
pub struct ConsumerHandle {
    pub(crate) conn_id: u64,
    pub(crate) prefetch: u16,
    pub(crate) outstanding: Arc<AtomicU64>,
    pub(crate) next_tag: Arc<AtomicU64>,
    pub(crate) outbound: mpsc::Sender<Frame>,
    pub(crate) unacked: Arc<DashMap<u64, UnackedDelivery>>,
}

/// Everything needed to settle a delivery later.
pub struct UnackedDelivery {
    pub(crate) queue: Arc<Queue>,
    pub(crate) message: QueuedMessage,
    pub(crate) outstanding: Arc<AtomicU64>,
}

impl UnackedDelivery {
    /// Settle as acknowledged: the message is gone and the window slot
    /// frees up.
    pub(crate) fn settle_ack(self) {
        self.outstanding.fetch_sub(1, AtomicOrdering::SeqCst);
        self.queue.slot_freed();
    }

    /// Settle as rejected: requeue ahead of fresh messages, or drop.
    pub(crate) fn settle_nack(self, requeue: bool) {
        self.outstanding.fetch_sub(1, AtomicOrdering::SeqCst);
        if requeue {
            self.queue.requeue(self.message);
        } else {
            self.queue.slot_freed();
        }
    }

    /// Settle a consumer that disappeared: its messages go back.
    pub(crate) fn settle_disconnect(self) {
        self.outstanding.fetch_sub(1, AtomicOrdering::SeqCst);
        self.queue.requeue(self.message);
    }
}

struct QueueInner {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    redelivery: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerHandle>,
    next_consumer: usize,
    seq: u64,
}

enum Step {
    Deliver(ConsumerHandle, QueuedMessage),
    Wait(Option<DateTime<Utc>>),
}

/// A single named queue with its own delivery pump.
///
/// Ready messages are ordered by priority (descending) and publish order
/// within a priority. Requeued messages bypass the heap and are delivered
/// ahead of fresh ones, in requeue order.
pub struct Queue {
    name: String,
    inner: Mutex<QueueInner>,
    notify: Notify,
    metrics: Arc<BrokerMetrics>,
}

impl Queue {
    /// Create the queue and spawn its delivery pump.
    pub fn spawn(name: &str, metrics: Arc<BrokerMetrics>, shutdown: CancellationToken) -> Arc<Queue> {
        let queue = Arc::new(Queue {
            name: name.to_string(),
            inner: Mutex::new(QueueInner {
                ready: BinaryHeap::new(),
                delayed: BinaryHeap::new(),
                redelivery: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                seq: 0,
            }),
            notify: Notify::new(),
            metrics,
        });
        tokio::spawn(queue.clone().pump(shutdown));
        queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a payload. With a future `eta` the message is held back
    /// until due.
    pub fn publish(&self, payload: Vec<u8>, priority: u8, eta: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;
        let message = QueuedMessage {
            payload,
            priority,
            redelivered: false,
        };
        match eta {
            Some(due) if due > Utc::now() => inner.delayed.push(DelayedEntry { due, seq, message }),
            _ => inner.ready.push(ReadyEntry {
                priority,
                seq,
                message,
            }),
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Put a message back, marked redelivered, ahead of fresh messages.
    pub fn requeue(&self, mut message: QueuedMessage) {
        message.redelivered = true;
        self.inner.lock().redelivery.push_back(message);
        self.notify.notify_one();
    }

    pub(crate) fn register_consumer(&self, consumer: ConsumerHandle) {
        self.inner.lock().consumers.push(consumer);
        self.notify.notify_one();
    }

    pub(crate) fn deregister_consumer(&self, conn_id: u64) {
        self.inner.lock().consumers.retain(|c| c.conn_id != conn_id);
    }

    /// (deliverable, delayed) message counts.
    pub fn depths(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (
            inner.ready.len() + inner.redelivery.len(),
            inner.delayed.len(),
        )
    }

    /// Wake the pump after a prefetch window slot opened.
    pub(crate) fn slot_freed(&self) {
        self.notify.notify_one();
    }

    async fn pump(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            match self.next_step() {
                Step::Deliver(consumer, message) => self.deliver(consumer, message).await,
                Step::Wait(Some(wake)) => {
                    let delay = (wake - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Step::Wait(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
        debug!(queue = %self.name, "queue pump stopped");
    }

    fn next_step(&self) -> Step {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        while inner.delayed.peek().map_or(false, |entry| entry.due <= now) {
            if let Some(entry) = inner.delayed.pop() {
                inner.ready.push(ReadyEntry {
                    priority: entry.message.priority,
                    seq: entry.seq,
                    message: entry.message,
                });
            }
        }
        let next_due = inner.delayed.peek().map(|entry| entry.due);

        if inner.ready.is_empty() && inner.redelivery.is_empty() {
            return Step::Wait(next_due);
        }
        let Some(consumer) = Self::pick_consumer(&mut inner) else {
            return Step::Wait(next_due);
        };

        // Claim the window slot before releasing the lock.
        consumer.outstanding.fetch_add(1, AtomicOrdering::SeqCst);
        let message = inner
            .redelivery
            .pop_front()
            .or_else(|| inner.ready.pop().map(|entry| entry.message));
        match message {
            Some(message) => Step::Deliver(consumer, message),
            None => {
                consumer.outstanding.fetch_sub(1, AtomicOrdering::SeqCst);
                Step::Wait(next_due)
            }
        }
    }

    /// Round-robin over consumers with room in their prefetch window.
    fn pick_consumer(inner: &mut QueueInner) -> Option<ConsumerHandle> {
        inner.consumers.retain(|c| !c.outbound.is_closed());
        if inner.consumers.is_empty() {
            return None;
        }
        let count = inner.consumers.len();
        for offset in 0..count {
            let index = (inner.next_consumer + offset) % count;
            let consumer = &inner.consumers[index];
            let window = consumer.prefetch as u64;
            if window == 0 || consumer.outstanding.load(AtomicOrdering::SeqCst) < window {
                inner.next_consumer = (index + 1) % count;
                return Some(consumer.clone());
            }
        }
        None
    }

    async fn deliver(self: &Arc<Self>, consumer: ConsumerHandle, message: QueuedMessage) {
        let delivery_tag = consumer.next_tag.fetch_add(1, AtomicOrdering::SeqCst);
        consumer.unacked.insert(
            delivery_tag,
            UnackedDelivery {
                queue: self.clone(),
                message: message.clone(),
                outstanding: consumer.outstanding.clone(),
            },
        );

        let frame = Frame::Deliver(Delivery {
            queue: self.name.clone(),
            delivery_tag,
            redelivered: message.redelivered,
            priority: message.priority,
            payload: message.payload.clone(),
        });

        if consumer.outbound.send(frame).await.is_err() {
            // The connection went away between selection and send.
            consumer.unacked.remove(&delivery_tag);
            consumer.outstanding.fetch_sub(1, AtomicOrdering::SeqCst);
            self.deregister_consumer(consumer.conn_id);
            self.requeue(message);
            return;
        }
        self.metrics
            .deliveries_total
            .with_label_values(&[&self.name])
            .inc();
    }
}
