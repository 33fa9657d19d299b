//! In-memory queue broker.
//!
//! Each address is a FIFO queue shared by its publishers and competing
//! subscribers. Messages are handed to subscribers with credit in
//! round-robin order and stay unacknowledged until the subscriber accepts,
//! rejects, releases, or modifies them. Released and modified messages go
//! back to the head of the queue; rejected ones are dropped.
//!
//! Durability and routing are out of scope; this broker backs the binary and
//! the test suite.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use super::{
    Broker,
    BrokerError,
    MessageHandler,
    MessageId,
    Publisher,
    SettleCallback,
    Subscriber,
    TxId,
};
use crate::performative::ErrorCondition;

#[derive(Default)]
struct Queue {
    ready: VecDeque<(MessageId, Bytes)>,
    unacked: HashMap<MessageId, (u64, Bytes)>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

struct Consumer {
    id: u64,
    handler: MessageHandler,
    credit: u32,
}

impl Queue {
    /// Hand ready messages to consumers with credit, round-robin.
    fn dispatch(&mut self) {
        while !self.ready.is_empty() {
            self.consumers.retain(|c| !c.handler.is_closed());
            let count = self.consumers.len();
            let Some(offset) = (0..count)
                .map(|i| (self.cursor + i) % count)
                .find(|&i| self.consumers[i].credit > 0)
            else {
                return;
            };
            let Some((message_id, body)) = self.ready.pop_front() else {
                return;
            };
            let consumer = &mut self.consumers[offset];
            if consumer.handler.on_message(message_id, body.clone()) {
                consumer.credit -= 1;
                self.unacked.insert(message_id, (consumer.id, body));
            } else {
                self.ready.push_front((message_id, body));
            }
            self.cursor = offset + 1;
        }
    }

    fn settle(&mut self, message_id: MessageId) -> Result<Bytes, BrokerError> {
        self.unacked
            .remove(&message_id)
            .map(|(_, body)| body)
            .ok_or(BrokerError::UnknownMessage(message_id))
    }

    fn requeue(&mut self, message_id: MessageId) -> Result<(), BrokerError> {
        let body = self.settle(message_id)?;
        self.ready.push_front((message_id, body));
        self.dispatch();
        Ok(())
    }
}

type SharedQueue = Arc<Mutex<Queue>>;

fn lock(queue: &SharedQueue) -> Result<MutexGuard<'_, Queue>, BrokerError> {
    queue.lock().map_err(|_| BrokerError::Unavailable {
        reason: "queue lock poisoned".into(),
    })
}

/// Queue broker held entirely in memory.
///
/// # Examples
///
/// ```
/// use amqpframe::broker::{Broker, MemoryBroker};
///
/// let broker = MemoryBroker::new().with_queue("queue/a");
/// assert!(broker.create_sender("queue/a").is_ok());
/// assert!(broker.create_sender("queue/missing").is_err());
/// ```
#[derive(Default)]
pub struct MemoryBroker {
    queues: DashMap<String, SharedQueue>,
    auto_create: bool,
    ids: Arc<AtomicU64>,
}

impl MemoryBroker {
    /// Create a broker with no queues that refuses unknown addresses.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Create queues on first use instead of refusing unknown addresses.
    #[must_use]
    pub fn auto_create(mut self, enabled: bool) -> Self {
        self.auto_create = enabled;
        self
    }

    /// Declare a queue.
    #[must_use]
    pub fn with_queue(self, address: impl Into<String>) -> Self {
        self.queues.entry(address.into()).or_default();
        self
    }

    /// Number of messages waiting for a consumer at `address`.
    #[must_use]
    pub fn ready_count(&self, address: &str) -> usize {
        let Some(entry) = self.queues.get(address) else {
            return 0;
        };
        lock(entry.value()).map_or(0, |queue| queue.ready.len())
    }

    fn queue(&self, address: &str) -> Result<SharedQueue, BrokerError> {
        if let Some(entry) = self.queues.get(address) {
            return Ok(Arc::clone(entry.value()));
        }
        if !self.auto_create {
            return Err(BrokerError::NotFound {
                address: address.to_owned(),
            });
        }
        debug!(address, "creating queue on first use");
        let entry = self.queues.entry(address.to_owned()).or_default();
        Ok(Arc::clone(entry.value()))
    }
}

impl Broker for MemoryBroker {
    fn create_sender(&self, address: &str) -> Result<Box<dyn Publisher>, BrokerError> {
        Ok(Box::new(MemoryPublisher {
            queue: self.queue(address)?,
            ids: Arc::clone(&self.ids),
        }))
    }

    fn create_receiver(
        &self,
        address: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscriber>, BrokerError> {
        let queue = self.queue(address)?;
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        lock(&queue)?.consumers.push(Consumer {
            id,
            handler,
            credit: 0,
        });
        Ok(Box::new(MemorySubscriber { queue, id }))
    }
}

struct MemoryPublisher {
    queue: SharedQueue,
    ids: Arc<AtomicU64>,
}

impl Publisher for MemoryPublisher {
    fn next_message_id(&mut self) -> MessageId {
        MessageId::new(self.ids.fetch_add(1, Ordering::Relaxed))
    }

    fn publish(
        &mut self,
        _tx_id: TxId,
        message_id: MessageId,
        body: Bytes,
        on_settle: SettleCallback,
    ) -> Result<(), BrokerError> {
        {
            let mut queue = lock(&self.queue)?;
            queue.ready.push_back((message_id, body));
            queue.dispatch();
        }
        on_settle.on_accepted(message_id);
        Ok(())
    }
}

struct MemorySubscriber {
    queue: SharedQueue,
    id: u64,
}

impl Subscriber for MemorySubscriber {
    fn flow(&mut self, _tx_id: TxId, _delivery_count: u32, credit: u32) {
        let Ok(mut queue) = lock(&self.queue) else {
            return;
        };
        if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == self.id) {
            consumer.credit = credit;
        }
        queue.dispatch();
    }

    fn accept(&mut self, _tx_id: TxId, message_id: MessageId) -> Result<(), BrokerError> {
        lock(&self.queue)?.settle(message_id).map(drop)
    }

    fn reject(
        &mut self,
        _tx_id: TxId,
        message_id: MessageId,
        error: Option<&ErrorCondition>,
    ) -> Result<(), BrokerError> {
        debug!(%message_id, ?error, "dropping rejected message");
        lock(&self.queue)?.settle(message_id).map(drop)
    }

    fn release(&mut self, _tx_id: TxId, message_id: MessageId) -> Result<(), BrokerError> {
        lock(&self.queue)?.requeue(message_id)
    }

    fn modified(
        &mut self,
        _tx_id: TxId,
        message_id: MessageId,
        _delivery_failed: bool,
        undeliverable_here: bool,
    ) -> Result<(), BrokerError> {
        let mut queue = lock(&self.queue)?;
        if undeliverable_here && queue.consumers.len() <= 1 {
            debug!(%message_id, "no other consumer; dropping undeliverable message");
            return queue.settle(message_id).map(drop);
        }
        queue.requeue(message_id)
    }

    fn close(&mut self) {
        let Ok(mut queue) = lock(&self.queue) else {
            return;
        };
        queue.consumers.retain(|c| c.id != self.id);
        let orphaned: Vec<MessageId> = queue
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == self.id)
            .map(|(id, _)| *id)
            .collect();
        for message_id in orphaned {
            if let Some((_, body)) = queue.unacked.remove(&message_id) {
                queue.ready.push_front((message_id, body));
            }
        }
        queue.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        broker::{BrokerEvent, EventReceiver, Settlement},
        link::LinkKey,
    };

    const fn key(handle: u32) -> LinkKey { LinkKey { handle, epoch: 0 } }

    #[fixture]
    fn broker() -> MemoryBroker { MemoryBroker::new().with_queue("queue/a") }

    fn publish(broker: &MemoryBroker, body: &'static [u8]) -> (MessageId, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut publisher = broker.create_sender("queue/a").expect("sender");
        let id = publisher.next_message_id();
        publisher
            .publish(None, id, Bytes::from_static(body), SettleCallback::new(key(0), tx))
            .expect("publish");
        (id, rx)
    }

    #[rstest]
    fn unknown_address_is_refused(broker: MemoryBroker) {
        let err = broker.create_sender("queue/b").err().expect("unknown address");
        assert_eq!(
            err,
            BrokerError::NotFound {
                address: "queue/b".into()
            }
        );
    }

    #[rstest]
    fn auto_create_declares_queue(broker: MemoryBroker) {
        let broker = broker.auto_create(true);
        assert!(broker.create_sender("queue/b").is_ok());
    }

    #[rstest]
    fn publish_settles_and_waits_for_credit(broker: MemoryBroker) {
        let (id, mut settled) = publish(&broker, b"one");
        assert_eq!(
            settled.try_recv().expect("settlement"),
            BrokerEvent::Settled {
                link: key(0),
                message_id: id,
                outcome: Settlement::Accepted,
            }
        );
        assert_eq!(broker.ready_count("queue/a"), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subscriber = broker
            .create_receiver("queue/a", MessageHandler::new(key(5), tx))
            .expect("receiver");
        assert!(rx.try_recv().is_err());
        subscriber.flow(None, 0, 1);
        assert!(matches!(
            rx.try_recv().expect("delivered"),
            BrokerEvent::Message { link, message_id, .. } if link == key(5) && message_id == id
        ));
        assert_eq!(broker.ready_count("queue/a"), 0);
        subscriber.accept(None, id).expect("accept");
        assert_eq!(
            subscriber.accept(None, id),
            Err(BrokerError::UnknownMessage(id))
        );
    }

    #[rstest]
    fn release_requeues_message(broker: MemoryBroker) {
        let (id, _settled) = publish(&broker, b"one");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subscriber = broker
            .create_receiver("queue/a", MessageHandler::new(key(1), tx))
            .expect("receiver");
        subscriber.flow(None, 0, 1);
        rx.try_recv().expect("first delivery");
        subscriber.release(None, id).expect("release");
        assert_eq!(broker.ready_count("queue/a"), 1);
        subscriber.flow(None, 1, 1);
        rx.try_recv().expect("redelivery");
    }

    #[rstest]
    fn close_returns_unacked_messages(broker: MemoryBroker) {
        let _ = publish(&broker, b"one");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subscriber = broker
            .create_receiver("queue/a", MessageHandler::new(key(1), tx))
            .expect("receiver");
        subscriber.flow(None, 0, 1);
        rx.try_recv().expect("delivery");
        subscriber.close();
        assert_eq!(broker.ready_count("queue/a"), 1);
    }
}
