//! Queue ingress: a fixed pool of workers draining the input topic
//!
//! Each worker owns one consumer and one producer and handles one message
//! at a time: decode, run the pipeline, publish the answer, then
//! acknowledge. Acknowledging only after a successful publish gives
//! at-least-once delivery.
//!
//! A message that is not a valid request can never succeed, so it is
//! acknowledged and dropped. A message that fails for any other reason
//! (origin down, cache store down) is negatively acknowledged and delivered
//! again after `queue.retry_delay`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{HttpConfig, QueueConfig};
use crate::handler::RequestHandler;
use crate::message::{Request, to_json};
use crate::queue::{ConnectionState, Delivery, MessageBroker, QueueConsumer, QueueProducer};
use crate::timing::{BACKEND, TOTAL, Timings};
use crate::{Error, Result};

/// Pause after a failed receive before trying again
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// What happened to one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Answer published and message acknowledged
    Published {
        /// Served from the cache
        cached: bool,
    },
    /// Undecodable or invalid request; acknowledged without an answer
    Discarded,
    /// Handed back to the broker for a later attempt
    Retry,
}

/// Worker pool bound to one input and one output topic
pub struct QueueIngress {
    broker: Arc<dyn MessageBroker>,
    handler: RequestHandler,
    config: QueueConfig,
    destination_header: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl QueueIngress {
    /// Create the pool. Workers start on [`QueueIngress::start`] and stop
    /// when `cancel` fires or [`QueueIngress::stop`] is called.
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        handler: RequestHandler,
        config: QueueConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            broker,
            handler,
            config,
            destination_header: HttpConfig::default().destination_header,
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// Header stripped from queued requests along with `Host`, as on the
    /// HTTP ingress
    #[must_use]
    pub fn with_destination_header(mut self, name: impl Into<String>) -> Self {
        self.destination_header = name.into();
        self
    }

    /// Open every worker's consumer and producer and start the workers.
    ///
    /// # Errors
    ///
    /// Returns `Error::Shutdown` if cancellation fired before or during
    /// start-up, or the broker error if a consumer or producer cannot be
    /// opened. Workers already started are cancelled in either case.
    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }
        if self.config.concurrency == 0 {
            return Err(Error::Config("queue concurrency must be at least 1".to_string()));
        }

        for index in 0..self.config.concurrency {
            let opened = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(Error::Shutdown),
                opened = self.open(index) => opened,
            };
            let (consumer, producer) = match opened {
                Ok(pair) => pair,
                Err(e) => {
                    self.cancel.cancel();
                    return Err(e);
                }
            };

            let name = self.worker_name(index);
            self.monitor(&name, "consumer", consumer.state());
            self.monitor(&name, "producer", producer.state());

            let worker = Worker {
                name,
                consumer,
                producer,
                handler: self.handler.clone(),
                destination_header: self.destination_header.clone(),
                retry_delay: self.config.retry_delay,
                timings: Timings::new(),
            };
            self.tracker.spawn(worker.run(self.cancel.clone()));
        }

        info!(
            broker = self.broker.name(),
            workers = self.config.concurrency,
            input = %self.config.input_topic,
            output = %self.config.output_topic,
            subscription = %self.config.subscription,
            "Queue ingress started"
        );
        Ok(())
    }

    /// Cancel the workers and wait for them to finish, at most `deadline`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Shutdown` if some worker is still running when the
    /// deadline passes.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        self.cancel.cancel();
        self.wait(deadline).await
    }

    /// Wait for the workers to finish after cancellation, at most `deadline`
    ///
    /// # Errors
    ///
    /// Returns `Error::Shutdown` if the deadline passes first.
    pub async fn wait(&self, deadline: Duration) -> Result<()> {
        self.tracker.close();
        if tokio::time::timeout(deadline, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.tracker.len(),
                deadline = ?deadline,
                "Queue workers did not stop in time"
            );
            return Err(Error::Shutdown);
        }
        info!("Queue ingress stopped");
        Ok(())
    }

    /// Token that stops the workers
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn worker_name(&self, index: usize) -> String {
        format!("{}-{index}", self.config.subscription)
    }

    async fn open(&self, index: usize) -> Result<(Box<dyn QueueConsumer>, Box<dyn QueueProducer>)> {
        let consumer = self
            .broker
            .consumer(
                &self.config.input_topic,
                &self.config.subscription,
                &self.worker_name(index),
            )
            .await?;
        let producer = self.broker.producer(&self.config.output_topic).await?;
        Ok((consumer, producer))
    }

    /// Log state transitions until a final state or shutdown
    fn monitor(
        &self,
        worker: &str,
        role: &'static str,
        mut state: watch::Receiver<ConnectionState>,
    ) {
        let worker = worker.to_string();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                let current = *state.borrow_and_update();
                debug!(worker = %worker, role, state = %current, "Queue connection state");
                if current.is_final() {
                    break;
                }
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

struct Worker {
    name: String,
    consumer: Box<dyn QueueConsumer>,
    producer: Box<dyn QueueProducer>,
    handler: RequestHandler,
    destination_header: String,
    retry_delay: Duration,
    timings: Timings,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        debug!(worker = %self.name, "Worker started");
        loop {
            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = self.consumer.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.process(&delivery).await {
                        error!(
                            worker = %self.name,
                            id = %delivery.id,
                            error = %e,
                            "Failed to complete message"
                        );
                    }
                }
                Ok(None) => {
                    info!(worker = %self.name, "Consumer closed");
                    break;
                }
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "Receive failed");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }

        if let Err(e) = self.consumer.close().await {
            warn!(worker = %self.name, error = %e, "Failed to close consumer");
        }
        if let Err(e) = self.producer.close().await {
            warn!(worker = %self.name, error = %e, "Failed to close producer");
        }
        debug!(worker = %self.name, "Worker stopped");
    }

    /// Handle one delivery. An `Err` means publishing or acknowledging
    /// failed; the message will come back.
    async fn process(&mut self, delivery: &Delivery) -> Result<Outcome> {
        self.timings.reset_all();
        self.timings.start(TOTAL);

        let mut request: Request = match serde_json::from_slice(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    worker = %self.name,
                    id = %delivery.id,
                    error = %e,
                    "Discarding undecodable message"
                );
                self.consumer.acknowledge(delivery).await?;
                return Ok(Outcome::Discarded);
            }
        };
        request.strip_routing_headers(&self.destination_header);

        let handled = match self.handler.handle(&request, &mut self.timings, None).await {
            Ok(handled) => handled,
            Err(e) if e.is_malformed() => {
                error!(
                    worker = %self.name,
                    id = %delivery.id,
                    request = %request,
                    error = %e,
                    "Discarding invalid request"
                );
                self.consumer.acknowledge(delivery).await?;
                return Ok(Outcome::Discarded);
            }
            Err(e) => {
                error!(
                    worker = %self.name,
                    id = %delivery.id,
                    request = %request,
                    error = %e,
                    redeliveries = delivery.redelivery_count,
                    retry_in = ?self.retry_delay,
                    "Request failed, scheduling redelivery"
                );
                self.consumer
                    .negative_acknowledge(delivery, self.retry_delay)
                    .await?;
                return Ok(Outcome::Retry);
            }
        };

        let payload = to_json(&handled.response)?;
        self.producer.publish(Bytes::from(payload)).await?;
        self.consumer.acknowledge(delivery).await?;

        self.timings.stop(TOTAL);
        info!(
            worker = %self.name,
            cached = handled.cached,
            elapsed_ms = self.timings.elapsed_ms(TOTAL),
            backend_ms = self.timings.elapsed_ms(BACKEND),
            destination = %request.url.as_deref().unwrap_or_default(),
            "Handled {} request",
            if handled.cached { "cached" } else { "non-cached" }
        );
        Ok(Outcome::Published {
            cached: handled.cached,
        })
    }
}
