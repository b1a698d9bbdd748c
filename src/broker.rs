//! Broker transport: durable named queues and request/reply over NATS
//! JetStream, generalizing `original_source`'s `aio_pika`/RabbitMQ usage
//! (spec.md §2, §4.5, §5, §6).
//!
//! Grounded on `examples/other_examples/03fe04cd_TheCowboyAI-alchemist__src-rss_feed_manager.rs.rs`
//! for the `async_nats`/JetStream shape (stream-per-subject-family, durable
//! pull consumer, `msg.ack()`). Request/reply uses core NATS's built-in
//! reply-subject mechanism, which plays the role of `reply_to` +
//! `correlation_id` filtering in `original_source/services/rss_manager/managers.py`'s
//! `handle_get_subscriptions` without hand-rolling an inbox.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, stream::RetentionPolicy};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connect failed: {0}")]
    Connect(#[from] async_nats::ConnectError),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(String),
    #[error("jetstream error: {0}")]
    JetStream(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<BrokerError> for PipelineError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Serde(e) => PipelineError::MalformedInput(e.to_string()),
            other => PipelineError::TransientFetch(anyhow::anyhow!(other)),
        }
    }
}

/// A thin wrapper around an `async_nats` client plus its JetStream context.
/// Every queue named in spec.md §6 is a durable JetStream stream with a
/// single work-queue subject; consumers are durable pull consumers so that
/// multiple process instances of one stage compete for the same messages
/// (spec.md §5's "pool of consumers" per node).
#[derive(Clone)]
pub struct Broker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl Broker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = async_nats::connect(url).await?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }

    /// Ensure a durable, file-backed stream exists for `queue`, mirroring
    /// `channel.declare_queue(..., durable=True)` in `original_source`.
    pub async fn declare_queue(&self, queue: &str) -> Result<jetstream::stream::Stream, BrokerError> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: queue.to_string(),
                subjects: vec![queue.to_string()],
                retention: RetentionPolicy::WorkQueue,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::JetStream(e.to_string()))
    }

    /// A durable pull consumer bound to `queue`, one per logical stage so
    /// every process of that stage competes for the same backlog.
    pub async fn consumer(&self, queue: &str, durable_name: &str) -> Result<PullConsumer, BrokerError> {
        let stream = self.declare_queue(queue).await?;
        stream
            .get_or_create_consumer(
                durable_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::JetStream(e.to_string()))
    }

    /// Fire-and-forget publish, used for the hot paths that tolerate
    /// duplicates (spec.md §5 Broker discipline).
    pub async fn publish<T: Serialize>(&self, subject: &str, payload: &T) -> Result<(), BrokerError> {
        let bytes = serde_json::to_vec(payload)?;
        self.client
            .publish(subject.to_string(), bytes.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    /// Synchronous request/reply, used by Repository RPC read operations
    /// (`ProfileRequest`, `SubscriptionListRequest` in spec.md §4.5/§6).
    /// Timeout is the caller's responsibility, defaulting to `Config::rpc_timeout`.
    pub async fn request<Req, Resp>(
        &self,
        subject: &str,
        payload: &Req,
        timeout: Duration,
    ) -> Result<Resp, BrokerError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let bytes = serde_json::to_vec(payload)?;
        let fut = self.client.request(subject.to_string(), bytes.into());
        let message = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| BrokerError::Timeout(timeout))?
            .map_err(|e| BrokerError::Request(e.to_string()))?;
        let resp = serde_json::from_slice(&message.payload)?;
        Ok(resp)
    }

    /// Reply to a request carried by `reply_subject` (the NATS-native stand-in
    /// for `message.reply_to` in `original_source`).
    pub async fn reply<Resp: Serialize>(&self, reply_subject: &str, payload: &Resp) -> Result<(), BrokerError> {
        self.publish(reply_subject, payload).await
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Subscribe to a request/reply subject (`user.profile.request`,
    /// `user.rss.subscriptions`). Core NATS carries the reply inbox on
    /// every inbound `Message`, so the RPC service side never needs a
    /// hand-rolled `reply_to` field.
    pub async fn service_requests(&self, subject: &str) -> Result<async_nats::Subscriber, BrokerError> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))
    }
}

/// Mint a fresh correlation id. Opaque and never rewritten once created,
/// per spec.md §3 invariant (v).
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
