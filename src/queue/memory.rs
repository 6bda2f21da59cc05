//! In-process message broker
//!
//! Each subscription is one shared queue that all of its consumers pull
//! from. Messages published to a topic before any subscription exists are
//! held back and handed to the first subscription created. A negatively
//! acknowledged message goes back on its subscription's queue once the
//! requested delay has passed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{ConnectionState, Delivery, MessageBroker, QueueConsumer, QueueProducer};
use crate::{Error, Result};

#[derive(Clone)]
struct Subscription {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
}

impl Subscription {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
struct Topic {
    subscriptions: HashMap<String, Subscription>,
    backlog: Vec<Delivery>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, Topic>>,
    next_id: AtomicU64,
}

/// Broker living inside the process
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create an empty broker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish without opening a producer
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery {
            id: id.to_string(),
            payload: payload.into(),
            redelivery_count: 0,
        };
        let mut topics = self.inner.topics.lock();
        let topic = topics.entry(topic.to_string()).or_default();
        if topic.subscriptions.is_empty() {
            topic.backlog.push(delivery);
            return;
        }
        for subscription in topic.subscriptions.values() {
            // The receiver lives as long as the subscription entry
            let _ = subscription.tx.send(delivery.clone());
        }
    }

    /// Number of messages waiting for a subscription on `topic`
    #[must_use]
    pub fn backlog(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |t| t.backlog.len())
    }

    fn subscribe(&self, topic: &str, subscription: &str) -> Subscription {
        let mut topics = self.inner.topics.lock();
        let topic = topics.entry(topic.to_string()).or_default();
        if let Some(existing) = topic.subscriptions.get(subscription) {
            return existing.clone();
        }
        let created = Subscription::new();
        for delivery in topic.backlog.drain(..) {
            let _ = created.tx.send(delivery);
        }
        topic
            .subscriptions
            .insert(subscription.to_string(), created.clone());
        created
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn consumer(
        &self,
        topic: &str,
        subscription: &str,
        consumer_name: &str,
    ) -> Result<Box<dyn QueueConsumer>> {
        let (state, _) = watch::channel(ConnectionState::Connected);
        debug!(topic, subscription, consumer = consumer_name, "Opened in-memory consumer");
        Ok(Box::new(MemoryConsumer {
            subscription: self.subscribe(topic, subscription),
            pending: HashMap::new(),
            state,
        }))
    }

    async fn producer(&self, topic: &str) -> Result<Box<dyn QueueProducer>> {
        let (state, _) = watch::channel(ConnectionState::Connected);
        Ok(Box::new(MemoryProducer {
            broker: self.clone(),
            topic: topic.to_string(),
            state,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Consumer on an in-process subscription
pub struct MemoryConsumer {
    subscription: Subscription,
    pending: HashMap<String, Delivery>,
    state: watch::Sender<ConnectionState>,
}

impl MemoryConsumer {
    fn is_closed(&self) -> bool {
        self.state.borrow().is_final()
    }

    fn requeue_pending(&mut self) {
        for (_, mut delivery) in self.pending.drain() {
            delivery.redelivery_count += 1;
            let _ = self.subscription.tx.send(delivery);
        }
    }
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn receive(&mut self) -> Result<Option<Delivery>> {
        if self.is_closed() {
            return Ok(None);
        }
        let delivery = self.subscription.rx.lock().await.recv().await;
        Ok(delivery.map(|delivery| {
            self.pending.insert(delivery.id.clone(), delivery.clone());
            delivery
        }))
    }

    async fn acknowledge(&mut self, delivery: &Delivery) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Queue("consumer is closed".to_string()));
        }
        self.pending
            .remove(&delivery.id)
            .map(|_| ())
            .ok_or_else(|| Error::Queue(format!("message {} is not pending", delivery.id)))
    }

    async fn negative_acknowledge(&mut self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let Some(mut delivery) = self.pending.remove(&delivery.id) else {
            return Err(Error::Queue(format!("message {} is not pending", delivery.id)));
        };
        delivery.redelivery_count += 1;
        let tx = self.subscription.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(delivery);
        });
        Ok(())
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn close(&mut self) -> Result<()> {
        self.requeue_pending();
        self.state.send_replace(ConnectionState::Closed);
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.requeue_pending();
    }
}

/// Producer on an in-process topic
pub struct MemoryProducer {
    broker: MemoryBroker,
    topic: String,
    state: watch::Sender<ConnectionState>,
}

#[async_trait]
impl QueueProducer for MemoryProducer {
    async fn publish(&mut self, payload: Bytes) -> Result<()> {
        if self.state.borrow().is_final() {
            return Err(Error::Queue("producer is closed".to_string()));
        }
        self.broker.publish(&self.topic, payload);
        Ok(())
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn close(&mut self) -> Result<()> {
        self.state.send_replace(ConnectionState::Closed);
        Ok(())
    }
}
