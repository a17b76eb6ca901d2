//! In-process broker.
//!
//! Behaves like a single AMQP broker as far as the pipeline can observe:
//! deliveries stay outstanding until settled, settling on a dead connection
//! fails, and everything outstanding returns to the head of its queue marked
//! redelivered when the owning connection closes. Tests can sever
//! every live connection with [`InMemoryBroker::disconnect`] and make the next
//! dials fail with [`InMemoryBroker::fail_next_connects`].

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    Acknowledger, Delivery, DeliveryStream, QueueConnection, QueueConnector, QueueError, Result,
    SubscribeOptions,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: Option<String>,
    payload: Vec<u8>,
    redelivered: bool,
}

struct Outstanding {
    queue: String,
    connection_id: u64,
    message: StoredMessage,
}

/// A message sent through [`QueueConnection::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

/// Running counters, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connects: u64,
    pub failed_connects: u64,
    pub disconnects: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    declared: HashSet<String>,
    outstanding: HashMap<u64, Outstanding>,
    published: Vec<PublishedMessage>,
    /// Bumped by `disconnect`; connections from older generations are dead
    generation: u64,
    next_connection_id: u64,
    next_tag: u64,
    failing_connects: u32,
    stats: BrokerStats,
}

impl BrokerState {
    /// Put outstanding deliveries back at the head of their queues, oldest
    /// first, marked redelivered.
    fn return_outstanding(&mut self, mut matches: impl FnMut(&Outstanding) -> bool) -> usize {
        let mut tags: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|(_, o)| matches(o))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in &tags {
            if let Some(mut o) = self.outstanding.remove(tag) {
                o.message.redelivered = true;
                self.queues.entry(o.queue).or_default().push_front(o.message);
            }
        }
        tags.len()
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Producer side: append a message without a broker message id.
    pub fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.push(queue, None, payload.into());
    }

    pub fn enqueue_with_id(&self, queue: &str, message_id: &str, payload: impl Into<Vec<u8>>) {
        self.push(queue, Some(message_id.to_string()), payload.into());
    }

    fn push(&self, queue: &str, message_id: Option<String>, payload: Vec<u8>) {
        self.shared
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                message_id,
                payload,
                redelivered: false,
            });
        self.shared.notify.notify_waiters();
    }

    /// Messages waiting in `queue`, not counting outstanding ones.
    pub fn pending(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Deliveries handed out and not yet settled.
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().outstanding.len()
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.shared.state.lock().declared.contains(queue)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().published.clone()
    }

    pub fn stats(&self) -> BrokerStats {
        self.shared.state.lock().stats.clone()
    }

    /// Make the next `count` dial attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.state.lock().failing_connects = count;
    }

    /// Drop every live connection as a broker restart would. Subscriptions end
    /// and outstanding deliveries return to their queues.
    pub fn disconnect(&self) {
        let returned = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.stats.disconnects += 1;
            state.return_outstanding(|_| true)
        };
        self.shared.notify.notify_waiters();
        info!(returned, "In-memory broker dropped all connections");
    }
}

#[async_trait]
impl QueueConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn QueueConnection>> {
        let mut state = self.shared.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            state.stats.failed_connects += 1;
            return Err(QueueError::Connection("broker unavailable".to_string()));
        }

        state.next_connection_id += 1;
        state.stats.connects += 1;
        let connection = MemoryConnection {
            shared: self.shared.clone(),
            id: state.next_connection_id,
            generation: state.generation,
            closed: Arc::new(AtomicBool::new(false)),
        };
        debug!(connection_id = connection.id, "In-memory connection opened");
        Ok(Arc::new(connection))
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    generation: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn alive(&self, state: &BrokerState) -> bool {
        !self.closed.load(Ordering::SeqCst) && state.generation == self.generation
    }
}

#[async_trait]
impl QueueConnection for MemoryConnection {
    async fn subscribe(&self, options: &SubscribeOptions) -> Result<DeliveryStream> {
        {
            let mut state = self.shared.state.lock();
            if !self.alive(&state) {
                return Err(QueueError::Closed);
            }
            state.declared.insert(options.queue_name.clone());
            state.queues.entry(options.queue_name.clone()).or_default();
        }

        let shared = self.shared.clone();
        let closed = self.closed.clone();
        let generation = self.generation;
        let connection_id = self.id;
        let queue = options.queue_name.clone();

        let deliveries = stream::unfold((), move |()| {
            let shared = shared.clone();
            let closed = closed.clone();
            let queue = queue.clone();
            async move {
                loop {
                    let notified = shared.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    {
                        let mut state = shared.state.lock();
                        if closed.load(Ordering::SeqCst) || state.generation != generation {
                            return None;
                        }
                        let next = state.queues.get_mut(&queue).and_then(VecDeque::pop_front);
                        if let Some(message) = next {
                            state.next_tag += 1;
                            let tag = state.next_tag;
                            state.stats.delivered += 1;
                            state.outstanding.insert(
                                tag,
                                Outstanding {
                                    queue: queue.clone(),
                                    connection_id,
                                    message: message.clone(),
                                },
                            );
                            let acker = MemoryAcker {
                                shared: shared.clone(),
                                tag,
                            };
                            let delivery = Delivery::new(
                                message.payload,
                                message.message_id,
                                message.redelivered,
                                Box::new(acker),
                            );
                            return Some((Ok(delivery), ()));
                        }
                    }

                    notified.await;
                }
            }
        });

        Ok(deliveries.boxed())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if !self.alive(&state) {
                return Err(QueueError::Closed);
            }
            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
            });
            // Default exchange routes straight to the queue named by the key
            if exchange.is_empty() {
                state
                    .queues
                    .entry(routing_key.to_string())
                    .or_default()
                    .push_back(StoredMessage {
                        message_id: None,
                        payload: payload.to_vec(),
                        redelivered: false,
                    });
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let state = self.shared.state.lock();
        self.alive(&state)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let id = self.id;
        let returned = self
            .shared
            .state
            .lock()
            .return_outstanding(|o| o.connection_id == id);
        self.shared.notify.notify_waiters();
        debug!(connection_id = id, returned, "In-memory connection closed");
        Ok(())
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        match state.outstanding.remove(&self.tag) {
            Some(_) => {
                state.stats.acked += 1;
                Ok(())
            }
            None => Err(QueueError::Ack(format!(
                "delivery tag {} is no longer outstanding",
                self.tag
            ))),
        }
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            let Some(mut o) = state.outstanding.remove(&self.tag) else {
                warn!(tag = self.tag, "Reject for a delivery that is no longer outstanding");
                return Err(QueueError::Ack(format!(
                    "delivery tag {} is no longer outstanding",
                    self.tag
                )));
            };
            if requeue {
                o.message.redelivered = true;
                state.queues.entry(o.queue).or_default().push_front(o.message);
                state.stats.requeued += 1;
            } else {
                state.stats.discarded += 1;
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
