//! Message broker abstraction for the queue ingress
//!
//! A worker holds one [`QueueConsumer`] on the input topic and one
//! [`QueueProducer`] on the output topic. Consumers sharing a subscription
//! name compete: each message goes to exactly one of them. A received
//! message stays pending until acknowledged. A negatively acknowledged
//! message is delivered again after a delay; anything still pending when
//! its consumer goes away is delivered again as well.
//!
//! Brokers:
//! - [`memory::MemoryBroker`]: in-process, for tests and single-node use.
//! - [`redis::RedisBroker`]: Redis Streams with consumer groups.

pub mod memory;
pub mod redis;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

use crate::Result;

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned message id
    pub id: String,
    /// Raw payload
    pub payload: Bytes,
    /// How many times this message was delivered before
    pub redelivery_count: u32,
}

/// Connection state of a consumer or producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connecting for the first time
    Connecting,
    /// Ready
    Connected,
    /// Lost the connection; the client keeps retrying
    Disconnected,
    /// Closed on request
    Closed,
    /// Failed permanently
    Faulted,
}

impl ConnectionState {
    /// Whether no further transitions will follow
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Receiving side of a subscription
#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait for the next message. `Ok(None)` means the consumer was closed.
    ///
    /// Dropping the returned future before it completes loses no message.
    async fn receive(&mut self) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery so it is never redelivered
    async fn acknowledge(&mut self, delivery: &Delivery) -> Result<()>;

    /// Give a delivery back for another attempt no sooner than `delay`
    async fn negative_acknowledge(&mut self, delivery: &Delivery, delay: Duration) -> Result<()>;

    /// Watch the connection state
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Close the consumer; unacknowledged deliveries become available again
    async fn close(&mut self) -> Result<()>;
}

/// Publishing side of a topic
#[async_trait]
pub trait QueueProducer: Send {
    /// Publish a payload
    async fn publish(&mut self, payload: Bytes) -> Result<()>;

    /// Watch the connection state
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Close the producer
    async fn close(&mut self) -> Result<()>;
}

/// Factory for consumers and producers
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Open a consumer on `topic` under the shared `subscription`.
    ///
    /// `consumer_name` identifies the consumer within the subscription and
    /// should be stable across restarts.
    async fn consumer(
        &self,
        topic: &str,
        subscription: &str,
        consumer_name: &str,
    ) -> Result<Box<dyn QueueConsumer>>;

    /// Open a producer on `topic`
    async fn producer(&self, topic: &str) -> Result<Box<dyn QueueProducer>>;

    /// Broker name for logs
    fn name(&self) -> &'static str;
}
