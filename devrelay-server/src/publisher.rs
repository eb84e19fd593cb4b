//! Outbound publishing to the broker.
//!
//! The broker channel is owned by a single actor task. Connection handlers
//! never touch it directly: they hand a payload to a [`PublishPort`] and wait
//! for the actor to report the outcome. This keeps publishes from one
//! connection in order and guarantees that no two publishes are ever in
//! flight on the transport at the same time.

use crate::config::BrokerConfig;
use crate::error::PublishError;
use async_trait::async_trait;
use bytes::Bytes;
use devrelay_protocol::DeviceRecord;
use lapin::options::BasicPublishOptions;
use lapin::types::ShortString;
use lapin::{BasicProperties, Channel};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Where and how records are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
}

impl PublishTarget {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: String::new(),
            content_type: "application/json".to_string(),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            routing_key: config.routing_key.clone(),
            content_type: config.content_type.clone(),
        }
    }
}

/// A transport that can deliver one message body to the broker.
#[async_trait]
pub trait BrokerSink: Send + 'static {
    /// Publishes `body` to `target`. Called from exactly one task at a time.
    async fn publish(&mut self, target: &PublishTarget, body: &[u8]) -> Result<(), PublishError>;
}

/// Publishes over an AMQP channel.
///
/// Messages carry a content type and no delivery mode, so the broker treats
/// them as transient. Publisher confirms are not awaited.
pub struct AmqpSink {
    channel: Channel,
}

impl AmqpSink {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl BrokerSink for AmqpSink {
    async fn publish(&mut self, target: &PublishTarget, body: &[u8]) -> Result<(), PublishError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(target.content_type.clone()));

        self.channel
            .basic_publish(
                &target.exchange,
                &target.routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?;
        Ok(())
    }
}

/// A message recorded by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

type RejectFn = dyn Fn(&[u8]) -> bool + Send + Sync;

/// In-memory sink that records every publish, for tests and dry runs.
///
/// Clones share the same message log.
#[derive(Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<PublishedMessage>>>,
    reject: Option<Arc<RejectFn>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes publishes whose body matches `predicate` fail.
    pub fn reject_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.reject = Some(Arc::new(predicate));
        self
    }

    /// Returns a snapshot of the messages published so far.
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().clone()
    }

    /// Forgets every message recorded so far.
    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

#[async_trait]
impl BrokerSink for MemorySink {
    async fn publish(&mut self, target: &PublishTarget, body: &[u8]) -> Result<(), PublishError> {
        if let Some(ref reject) = self.reject {
            if reject(body) {
                return Err(PublishError::Rejected(format!(
                    "{} byte message refused by sink",
                    body.len()
                )));
            }
        }

        self.messages.lock().push(PublishedMessage {
            exchange: target.exchange.clone(),
            routing_key: target.routing_key.clone(),
            content_type: target.content_type.clone(),
            body: body.to_vec(),
        });
        Ok(())
    }
}

struct PublishRequest {
    body: Bytes,
    reply: oneshot::Sender<Result<(), PublishError>>,
}

/// Cloneable handle to the publishing actor.
#[derive(Clone)]
pub struct PublishPort {
    tx: mpsc::Sender<PublishRequest>,
}

impl PublishPort {
    /// Spawns the actor that owns `sink` and returns a handle to it.
    ///
    /// The actor stops once every handle has been dropped.
    pub fn spawn<S: BrokerSink>(
        sink: S,
        target: PublishTarget,
        queue_depth: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let task = tokio::spawn(Self::run(sink, target, rx));
        (Self { tx }, task)
    }

    /// Publishes the record's payload and waits for the outcome.
    ///
    /// Exactly one sink call is made per invocation; failures are not retried.
    pub async fn publish(&self, record: DeviceRecord) -> Result<(), PublishError> {
        self.publish_bytes(Bytes::from(record.payload.into_bytes()))
            .await
    }

    /// Publishes a raw message body and waits for the outcome.
    pub async fn publish_bytes(&self, body: Bytes) -> Result<(), PublishError> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(PublishRequest { body, reply })
            .await
            .map_err(|_| PublishError::PortClosed)?;
        outcome.await.map_err(|_| PublishError::PortClosed)?
    }

    /// Returns whether the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn run<S: BrokerSink>(
        mut sink: S,
        target: PublishTarget,
        mut rx: mpsc::Receiver<PublishRequest>,
    ) {
        tracing::debug!("Publish port started for exchange '{}'", target.exchange);

        while let Some(request) = rx.recv().await {
            let result = sink.publish(&target, &request.body).await;
            // The requester may have gone away; the outcome is then irrelevant.
            let _ = request.reply.send(result);
        }

        tracing::debug!("Publish port stopped");
    }
}
