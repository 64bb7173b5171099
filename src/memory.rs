//! In-memory queue service and store.
//!
//! Both follow the semantics the daemons rely on from the real services: deliveries stay
//! unacknowledged until acked by tag, closing a channel requeues its unacked deliveries and
//! failures can be injected at every step. Used by the test suites.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::bootstrap::Connector;
use crate::database::Store;
use crate::error::{QueueError, StoreError};
use crate::queue::{Delivery, DeliveryStream, DeliveryTag, QueueChannel, QueueSpec};
use crate::record::{Reading, StoredReading};

#[derive(Debug, Clone)]
struct Message
{
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked
{
    channel: u64,
    message: Message,
}

#[derive(Debug)]
struct QueueState
{
    spec: QueueSpec,
    ready: VecDeque<Message>,
    unacked: BTreeMap<DeliveryTag, Unacked>,
}

#[derive(Debug, Default)]
struct BrokerState
{
    queues: HashMap<String, QueueState>,
    closed_channels: Vec<u64>,
    acked: Vec<DeliveryTag>,
    next_tag: u64,
    failing_publishes: u32,
}

impl BrokerState {
    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState, QueueError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| QueueError::Consume(format!("no queue \'{}\'", name)))
    }

    fn is_closed(&self, channel: u64) -> bool {
        self.closed_channels.contains(&channel)
    }

    /// Moves unacked deliveries matching `filter` back to the head of their queue.
    fn requeue(&mut self, filter: impl Fn(u64) -> bool) {
        for queue in self.queues.values_mut() {
            let tags: Vec<DeliveryTag> = queue.unacked
                .iter()
                .filter(|(_, unacked)| filter(unacked.channel))
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    queue.ready.push_front(Message { redelivered: true, ..unacked.message });
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct BrokerInner
{
    state: Mutex<BrokerState>,
    notify: Notify,
    next_channel: AtomicU64,
}

/// A single-process queue service with explicit acknowledgements.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker
{
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new channel on the broker.
    pub fn channel(&self) -> MemoryChannel {
        let id = self.inner.next_channel.fetch_add(1, Ordering::SeqCst);
        MemoryChannel { inner: Arc::clone(&self.inner), id }
    }

    /// A connector handing out fresh channels, failing the first `failures` attempts.
    pub fn connector(&self, failures: u32) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            failures: AtomicU32::new(failures),
            connects: AtomicU32::new(0),
        }
    }

    /// Lets the next `count` publishes fail as if the connection dropped mid-run.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.state.lock().failing_publishes = count;
    }

    /// Closes every open channel, as a lost broker connection would.
    ///
    /// Unacked deliveries of the closed channels go back to the head of their queue.
    pub fn sever(&self) {
        let upto = self.inner.next_channel.load(Ordering::SeqCst);
        {
            let mut state = self.inner.state.lock();
            for id in 0..upto {
                if !state.is_closed(id) {
                    state.closed_channels.push(id);
                }
            }
            state.requeue(|_| true);
        }
        self.inner.notify.notify_waiters();
    }

    /// Requeues every unacked delivery without closing any channel.
    pub fn recover(&self) {
        self.inner.state.lock().requeue(|_| true);
        self.inner.notify.notify_waiters();
    }

    /// Messages waiting for delivery.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner.state.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner.state.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Messages not yet acknowledged, delivered or not.
    pub fn pending_count(&self, queue: &str) -> usize {
        self.ready_count(queue) + self.unacked_count(queue)
    }

    /// Bodies of the messages waiting for delivery, in delivery order.
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner.state.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Every tag acknowledged so far, in order.
    pub fn acked_tags(&self) -> Vec<DeliveryTag> {
        self.inner.state.lock().acked.clone()
    }
}

/// A channel opened on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryChannel
{
    inner: Arc<BrokerInner>,
    id: u64,
}

impl MemoryChannel {
    /// Closes the channel and requeues its unacked deliveries.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.is_closed(self.id) {
                state.closed_channels.push(self.id);
            }
            let id = self.id;
            state.requeue(|channel| channel == id);
        }
        self.inner.notify.notify_waiters();
    }

    fn ensure_open(&self, state: &BrokerState) -> Result<(), QueueError> {
        if state.is_closed(self.id) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pops the next ready message of `queue` for `channel`.
///
/// `Ok(None)` means the queue is empty right now.
fn next_delivery(inner: &BrokerInner, queue: &str, channel: u64) -> Result<Option<Delivery>, QueueError> {
    let mut state = inner.state.lock();
    if state.is_closed(channel) {
        return Err(QueueError::Closed);
    }
    let message = match state.queue_mut(queue)?.ready.pop_front() {
        Some(message) => message,
        None => {
            return Ok(None);
        }
    };
    state.next_tag += 1;
    let tag = DeliveryTag(state.next_tag);
    state.queue_mut(queue)?.unacked.insert(tag, Unacked { channel, message: message.clone() });

    Ok(Some(Delivery { tag, body: message.body, redelivered: message.redelivered }))
}

#[async_trait]
impl QueueChannel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock();
        self.ensure_open(&state)?;

        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec == *spec => Ok(()),
            Some(_) => Err(QueueError::DeclareMismatch { queue: spec.name.clone() }),
            None => {
                state.queues.insert(spec.name.clone(), QueueState {
                    spec: spec.clone(),
                    ready: VecDeque::new(),
                    unacked: BTreeMap::new(),
                });
                Ok(())
            }
        }
    }

    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock();
            self.ensure_open(&state)?;

            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(QueueError::Publish("connection reset by peer".to_string()));
            }

            // The default exchange drops messages without a matching queue.
            if let Some(queue) = state.queues.get_mut(routing_key) {
                queue.ready.push_back(Message { body: body.to_vec(), redelivered: false });
            }
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, QueueError> {
        {
            let mut state = self.inner.state.lock();
            self.ensure_open(&state)?;
            state.queue_mut(queue)?;
        }

        let inner = Arc::clone(&self.inner);
        let channel = self.id;
        let queue = queue.to_string();

        let stream = futures::stream::unfold(false, move |finished| {
            let inner = Arc::clone(&inner);
            let queue = queue.clone();
            async move {
                if finished {
                    return None;
                }
                loop {
                    let notified = inner.notify.notified();
                    match next_delivery(&inner, &queue, channel) {
                        Ok(Some(delivery)) => return Some((Ok(delivery), false)),
                        Ok(None) => notified.await,
                        Err(err) => return Some((Err(err), true)),
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock();
        self.ensure_open(&state)?;

        let owned = state.queues
            .values_mut()
            .find_map(|queue| {
                let owner = queue.unacked.get(&tag).map(|unacked| unacked.channel);
                if owner == Some(self.id) {
                    queue.unacked.remove(&tag)
                } else {
                    None
                }
            });

        match owned {
            Some(_) => {
                state.acked.push(tag);
                Ok(())
            }
            None => Err(QueueError::Ack { tag: tag.0, reason: "unknown delivery tag".to_string() }),
        }
    }
}

#[derive(Debug, Error)]
#[error("connection refused")]
pub struct ConnectionRefused;

/// Connector for [`MemoryBroker`] channels with injectable startup failures.
#[derive(Debug)]
pub struct MemoryConnector
{
    broker: MemoryBroker,
    failures: AtomicU32,
    connects: AtomicU32,
}

impl MemoryConnector {
    /// Number of successful connects so far.
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Handle = MemoryChannel;
    type Error = ConnectionRefused;

    fn target(&self) -> String {
        "in-memory broker".to_string()
    }

    async fn connect(&self) -> Result<MemoryChannel, ConnectionRefused> {
        let refused = self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionRefused);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.broker.channel())
    }
}

/// Store keeping rows in memory with auto-incremented keys starting at 1.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore
{
    inner: Arc<Mutex<StoreState>>,
}

#[derive(Debug, Default)]
struct StoreState
{
    rows: Vec<StoredReading>,
    failing_inserts: u32,
    failing_probes: u32,
    attempts: u32,
    schema_ready: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets the next `count` inserts fail.
    pub fn fail_next_inserts(&self, count: u32) {
        self.inner.lock().failing_inserts = count;
    }

    /// Lets the next `count` readiness probes fail.
    pub fn fail_next_probes(&self, count: u32) {
        self.inner.lock().failing_probes = count;
    }

    pub fn rows(&self) -> Vec<StoredReading> {
        self.inner.lock().rows.clone()
    }

    /// Number of insert calls, failed ones included.
    pub fn insert_attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn schema_ready(&self) -> bool {
        self.inner.lock().schema_ready
    }

    /// A connector whose handle is this store once its readiness probe passes.
    pub fn connector(&self) -> MemoryStoreConnector {
        MemoryStoreConnector { store: self.clone() }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        if state.failing_probes > 0 {
            state.failing_probes -= 1;
            return Err(StoreError::Unavailable);
        }
        state.schema_ready = true;
        Ok(())
    }

    async fn insert(&self, reading: &Reading) -> Result<i32, StoreError> {
        let mut state = self.inner.lock();
        state.attempts += 1;
        if !state.schema_ready {
            return Err(StoreError::Rejected("relation \"TelemetryLogs\" does not exist".to_string()));
        }
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(StoreError::Unavailable);
        }
        let id = state.rows.len() as i32 + 1;
        state.rows.push(StoredReading { id, reading: reading.clone() });
        Ok(id)
    }
}

/// Connector probing a [`MemoryStore`] for readiness.
#[derive(Debug, Clone)]
pub struct MemoryStoreConnector
{
    store: MemoryStore,
}

#[async_trait]
impl Connector for MemoryStoreConnector {
    type Handle = MemoryStore;
    type Error = StoreError;

    fn target(&self) -> String {
        "in-memory store".to_string()
    }

    async fn connect(&self) -> Result<MemoryStore, StoreError> {
        self.store.ensure_schema().await?;
        Ok(self.store.clone())
    }
}
