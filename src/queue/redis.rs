//! Redis Streams broker
//!
//! A topic is a stream and a subscription is a consumer group on it.
//! Publishing is `XADD <topic> * payload <bytes>`, receiving is
//! `XREADGROUP` and acknowledging is `XACK`. The group is created at the
//! start of the stream, so messages published before the first worker
//! came up are still consumed.
//!
//! A consumer first replays the entries still pending under its own name
//! (delivered to an earlier incarnation but never acknowledged), then
//! switches to new entries. Consumer names must therefore be stable across
//! restarts for redelivery to work. A negative acknowledgement leaves the
//! entry pending and schedules another replay of the pending list once the
//! delay has passed.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ConnectionState, Delivery, MessageBroker, QueueConsumer, QueueProducer};
use crate::cache::redis::endpoint_url;
use crate::{Error, Result};

/// Stream entry field holding the payload
const PAYLOAD_FIELD: &str = "payload";
/// How long one `XREADGROUP` blocks before the loop re-issues it
const BLOCK: Duration = Duration::from_secs(1);

/// Broker on Redis Streams
pub struct RedisBroker {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBroker {
    /// Connect to the Redis server at `url`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unparseable URL, or the connection
    /// error if the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self> {
        let url = endpoint_url(url);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| Error::Config(format!("invalid queue URL '{url}': {e}")))?;
        let publisher = client.get_connection_manager().await?;
        info!(url = %url, "Connected to Redis Streams broker");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn consumer(
        &self,
        topic: &str,
        subscription: &str,
        consumer_name: &str,
    ) -> Result<Box<dyn QueueConsumer>> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        // Blocking reads would stall every other command on a shared
        // connection, so each consumer gets its own
        let mut connection = self.client.get_connection_manager().await?;

        let created: redis::RedisResult<()> = connection
            .xgroup_create_mkstream(topic, subscription, "0")
            .await;
        match created {
            Ok(()) => debug!(topic, subscription, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => {
                state.send_replace(ConnectionState::Faulted);
                return Err(Error::Queue(format!(
                    "failed to create consumer group '{subscription}' on '{topic}': {e}"
                )));
            }
        }
        state.send_replace(ConnectionState::Connected);

        Ok(Box::new(RedisConsumer {
            connection,
            stream: topic.to_string(),
            group: subscription.to_string(),
            name: consumer_name.to_string(),
            pending_cursor: Some("0".to_string()),
            replay_at: None,
            state,
        }))
    }

    async fn producer(&self, topic: &str) -> Result<Box<dyn QueueProducer>> {
        let (state, _) = watch::channel(ConnectionState::Connected);
        Ok(Box::new(RedisProducer {
            connection: self.publisher.clone(),
            stream: topic.to_string(),
            state,
        }))
    }

    fn name(&self) -> &'static str {
        "redis-streams"
    }
}

/// Record a command outcome on the state channel
fn track<T>(state: &watch::Sender<ConnectionState>, result: &redis::RedisResult<T>) {
    let next = match result {
        Ok(_) => ConnectionState::Connected,
        Err(e) if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() => {
            ConnectionState::Disconnected
        }
        Err(_) => return,
    };
    state.send_if_modified(|current| {
        if current.is_final() || *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

fn to_delivery(entry: &StreamId, redelivery_count: u32) -> Delivery {
    Delivery {
        id: entry.id.clone(),
        payload: entry
            .get::<Vec<u8>>(PAYLOAD_FIELD)
            .map(Bytes::from)
            .unwrap_or_default(),
        redelivery_count,
    }
}

/// Consumer in a Redis consumer group
pub struct RedisConsumer {
    connection: ConnectionManager,
    stream: String,
    group: String,
    name: String,
    /// Last replayed pending id; `None` once the backlog is exhausted
    pending_cursor: Option<String>,
    /// When to replay the pending list again after a negative acknowledgement
    replay_at: Option<Instant>,
    state: watch::Sender<ConnectionState>,
}

impl RedisConsumer {
    async fn read(&mut self, id: &str, block: bool) -> Result<Option<StreamId>> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.name)
            .count(1);
        if block {
            options = options.block(usize::try_from(BLOCK.as_millis()).unwrap_or(usize::MAX));
        }
        let result: redis::RedisResult<Option<StreamReadReply>> = self
            .connection
            .xread_options(&[&self.stream], &[id], &options)
            .await;
        track(&self.state, &result);
        let reply = result.map_err(|e| Error::Queue(format!("XREADGROUP failed: {e}")))?;
        Ok(reply
            .and_then(|reply| reply.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next()))
    }
}

#[async_trait]
impl QueueConsumer for RedisConsumer {
    async fn receive(&mut self) -> Result<Option<Delivery>> {
        if self.state.borrow().is_final() {
            return Ok(None);
        }

        loop {
            if self.pending_cursor.is_none()
                && self.replay_at.is_some_and(|at| Instant::now() >= at)
            {
                self.replay_at = None;
                self.pending_cursor = Some("0".to_string());
            }

            if let Some(cursor) = self.pending_cursor.clone() {
                match self.read(&cursor, false).await? {
                    Some(entry) => {
                        self.pending_cursor = Some(entry.id.clone());
                        debug!(id = %entry.id, consumer = %self.name, "Replaying pending entry");
                        return Ok(Some(to_delivery(&entry, 1)));
                    }
                    None => {
                        self.pending_cursor = None;
                        continue;
                    }
                }
            }

            if let Some(entry) = self.read(">", true).await? {
                return Ok(Some(to_delivery(&entry, 0)));
            }
        }
    }

    async fn acknowledge(&mut self, delivery: &Delivery) -> Result<()> {
        let result: redis::RedisResult<u64> = self
            .connection
            .xack(&self.stream, &self.group, &[&delivery.id])
            .await;
        track(&self.state, &result);
        let acked = result.map_err(|e| Error::Queue(format!("XACK failed: {e}")))?;
        if acked == 0 {
            warn!(id = %delivery.id, "Entry was not pending when acknowledged");
        }
        Ok(())
    }

    async fn negative_acknowledge(&mut self, delivery: &Delivery, delay: Duration) -> Result<()> {
        // The entry stays in the pending list until the replay picks it up
        let at = Instant::now() + delay;
        self.replay_at = Some(self.replay_at.map_or(at, |current| current.min(at)));
        debug!(id = %delivery.id, consumer = %self.name, delay = ?delay, "Scheduled redelivery");
        Ok(())
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn close(&mut self) -> Result<()> {
        // Unacknowledged entries stay in the group's pending list and are
        // replayed by the next consumer with this name
        self.state.send_replace(ConnectionState::Closed);
        Ok(())
    }
}

/// Producer appending to a stream
pub struct RedisProducer {
    connection: ConnectionManager,
    stream: String,
    state: watch::Sender<ConnectionState>,
}

#[async_trait]
impl QueueProducer for RedisProducer {
    async fn publish(&mut self, payload: Bytes) -> Result<()> {
        if self.state.borrow().is_final() {
            return Err(Error::Queue("producer is closed".to_string()));
        }
        let result: redis::RedisResult<String> = self
            .connection
            .xadd(&self.stream, "*", &[(PAYLOAD_FIELD, payload.as_ref())])
            .await;
        track(&self.state, &result);
        let id = result.map_err(|e| Error::Queue(format!("XADD failed: {e}")))?;
        debug!(stream = %self.stream, id = %id, "Published entry");
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
