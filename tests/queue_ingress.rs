//! Queue ingress tests over the in-process broker: worker pool lifecycle,
//! at-least-once publishing and handling of bad messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use http_cache::cache::{KeyDeriver, MemoryStore};
use http_cache::config::QueueConfig;
use http_cache::handler::RequestHandler;
use http_cache::ingress::queue::QueueIngress;
use http_cache::message::{Request, Response, to_json};
use http_cache::queue::{MemoryBroker, MessageBroker, QueueConsumer};
use http_cache::transport::Forwarder;
use http_cache::{Error, Result};

const WAIT: Duration = Duration::from_secs(5);

struct Origin {
    calls: AtomicUsize,
}

#[async_trait]
impl Forwarder for Origin {
    async fn forward(&self, request: &Request) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let url = request.url.clone().unwrap_or_default();
        Ok(Response::new(StatusCode::OK).with_body(url))
    }
}

fn config(concurrency: usize) -> QueueConfig {
    QueueConfig {
        enabled: true,
        url: "memory://".to_string(),
        concurrency,
        ..QueueConfig::default()
    }
}

fn ingress(broker: &MemoryBroker, origin: Arc<Origin>, concurrency: usize) -> QueueIngress {
    let handler = RequestHandler::new(
        Arc::new(MemoryStore::default()),
        origin,
        KeyDeriver::default(),
    );
    QueueIngress::new(
        Arc::new(broker.clone()),
        handler,
        config(concurrency),
        CancellationToken::new(),
    )
}

async fn output(broker: &MemoryBroker) -> Box<dyn QueueConsumer> {
    let defaults = QueueConfig::default();
    broker
        .consumer(&defaults.output_topic, "test", "test-0")
        .await
        .unwrap()
}

async fn next_response(consumer: &mut Box<dyn QueueConsumer>) -> Response {
    let delivery = tokio::time::timeout(WAIT, consumer.receive())
        .await
        .expect("no response published")
        .unwrap()
        .unwrap();
    consumer.acknowledge(&delivery).await.unwrap();
    serde_json::from_slice(&delivery.payload).unwrap()
}

fn request(url: &str) -> String {
    to_json(&Request::new("GET", url)).unwrap()
}

#[tokio::test]
async fn malformed_message_is_skipped_and_worker_keeps_going() {
    let broker = MemoryBroker::new();
    let origin = Arc::new(Origin { calls: AtomicUsize::new(0) });
    let input = QueueConfig::default().input_topic;

    broker.publish(&input, "{ not json");
    broker.publish(&input, request("http://origin.test/valid"));

    let ingress = ingress(&broker, origin.clone(), 1);
    ingress.start().await.unwrap();

    let mut out = output(&broker).await;
    let response = next_response(&mut out).await;
    assert_eq!(response.status_code, StatusCode::OK);
    assert_eq!(&response.content[..], b"http://origin.test/valid");

    // Nothing else is published for the bad payload
    assert!(
        tokio::time::timeout(Duration::from_millis(200), out.receive())
            .await
            .is_err()
    );
    assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.backlog(&input), 0);

    ingress.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn request_without_method_is_discarded() {
    let broker = MemoryBroker::new();
    let origin = Arc::new(Origin { calls: AtomicUsize::new(0) });
    let input = QueueConfig::default().input_topic;

    broker.publish(&input, r#"{"Url":"http://origin.test/"}"#);
    broker.publish(&input, request("http://origin.test/after"));

    let ingress = ingress(&broker, origin.clone(), 1);
    ingress.start().await.unwrap();

    let mut out = output(&broker).await;
    let response = next_response(&mut out).await;
    assert_eq!(&response.content[..], b"http://origin.test/after");
    assert_eq!(origin.calls.load(Ordering::SeqCst), 1);

    ingress.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn repeated_requests_are_answered_from_cache() {
    let broker = MemoryBroker::new();
    let origin = Arc::new(Origin { calls: AtomicUsize::new(0) });
    let input = QueueConfig::default().input_topic;

    for _ in 0..3 {
        broker.publish(&input, request("http://origin.test/same"));
    }

    let ingress = ingress(&broker, origin.clone(), 1);
    ingress.start().await.unwrap();

    let mut out = output(&broker).await;
    for _ in 0..3 {
        let response = next_response(&mut out).await;
        assert_eq!(&response.content[..], b"http://origin.test/same");
    }
    assert_eq!(origin.calls.load(Ordering::SeqCst), 1);

    ingress.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn pool_shares_the_subscription() {
    let broker = MemoryBroker::new();
    let origin = Arc::new(Origin { calls: AtomicUsize::new(0) });
    let input = QueueConfig::default().input_topic;

    let ingress = ingress(&broker, origin.clone(), 4);
    ingress.start().await.unwrap();

    for i in 0..20 {
        broker.publish(&input, request(&format!("http://origin.test/{i}")));
    }

    let mut out = output(&broker).await;
    let mut seen = Vec::new();
    for _ in 0..20 {
        let response = next_response(&mut out).await;
        seen.push(String::from_utf8(response.content.to_vec()).unwrap());
    }
    seen.sort();
    seen.dedup();

    // Each message went to exactly one worker
    assert_eq!(seen.len(), 20);
    assert_eq!(origin.calls.load(Ordering::SeqCst), 20);

    ingress.stop(WAIT).await.unwrap();
}

/// Origin that is down for its first call and healthy afterwards
struct FlakyOrigin {
    calls: AtomicUsize,
}

#[async_trait]
impl Forwarder for FlakyOrigin {
    async fn forward(&self, request: &Request) -> Result<Response> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::Upstream("connection refused".to_string()));
        }
        let url = request.url.clone().unwrap_or_default();
        Ok(Response::new(StatusCode::OK).with_body(url))
    }
}

#[tokio::test]
async fn failed_request_is_retried_until_the_origin_answers() {
    let broker = MemoryBroker::new();
    let origin = Arc::new(FlakyOrigin { calls: AtomicUsize::new(0) });
    let input = QueueConfig::default().input_topic;

    let handler = RequestHandler::new(
        Arc::new(MemoryStore::default()),
        origin.clone(),
        KeyDeriver::default(),
    );
    let ingress = QueueIngress::new(
        Arc::new(broker.clone()),
        handler,
        QueueConfig {
            retry_delay: Duration::from_millis(50),
            ..config(1)
        },
        CancellationToken::new(),
    );
    ingress.start().await.unwrap();
    broker.publish(&input, request("http://origin.test/flaky"));

    let mut out = output(&broker).await;
    let response = next_response(&mut out).await;
    assert_eq!(response.status_code, StatusCode::OK);
    assert_eq!(&response.content[..], b"http://origin.test/flaky");
    assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
    assert_eq!(broker.backlog(&input), 0);

    ingress.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn start_after_cancellation_fails() {
    let broker = MemoryBroker::new();
    let origin = Arc::new(Origin { calls: AtomicUsize::new(0) });

    let ingress = ingress(&broker, origin, 1);
    ingress.cancellation_token().cancel();

    assert!(matches!(ingress.start().await, Err(Error::Shutdown)));
}

#[tokio::test]
async fn stop_returns_once_idle_workers_exit() {
    let broker = MemoryBroker::new();
    let origin = Arc::new(Origin { calls: AtomicUsize::new(0) });

    let ingress = ingress(&broker, origin, 2);
    ingress.start().await.unwrap();
    ingress.stop(WAIT).await.unwrap();
    assert!(ingress.cancellation_token().is_cancelled());
}
