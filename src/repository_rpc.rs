//! Repository RPC service: broker-mediated CRUD for users, subscriptions,
//! and feeds (spec.md §4.5, §6).
//!
//! Grounded on `original_source/services/user_manager/managers.py`
//! (`UserQueueManager.handle_create_user`, `handle_get_user`,
//! `handle_update_preferences`, `handle_update_keywords`) and
//! `original_source/services/rss_manager/managers.py`
//! (`RssFeedManager.handle_add_message`, `handle_get_subscriptions`,
//! `handle_delete_message`). Each `handle_*` method there becomes one task
//! here consuming a durable JetStream queue (fire-and-forget writes,
//! manual ack after commit) or answering a core-NATS request/reply subject
//! (`user.profile.request`, `user.rss.subscriptions`).

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::domain::{
    AccountStatus, CreateUserRequest, ProfileData, ProfileReply, ProfileRequest,
    SetStatusRequest, StatusNotification, SubscribeFeedRequest, SubscriptionListReply,
    SubscriptionListRequest, UnsubscribeFeedRequest, UpdateAntipathyRequest,
    UpdatePreferencesRequest,
};
use crate::error::PipelineError;
use crate::metrics::{ERRORS_TOTAL, REQUESTS_TOTAL};
use crate::repository::Repository;

const STAGE: &str = "repository";

pub const USER_CREATE_QUEUE: &str = "user.create";
pub const USER_PREFERENCES_UPDATE_QUEUE: &str = "user.preferences.update";
pub const USER_ANTIPATHY_UPDATE_QUEUE: &str = "user.antipathy.update";
pub const USER_SET_STATUS_ID_QUEUE: &str = "user.set_status.id";
pub const USER_STATUS_NOTIFICATION_SUBJECT: &str = "user.status.notification";
pub const RSS_FEED_SUBSCRIBE_QUEUE: &str = "rss.feed.subscribe";
pub const RSS_FEED_UNSUBSCRIBE_QUEUE: &str = "rss.feed.unsubscribe";
pub const USER_PROFILE_REQUEST_SUBJECT: &str = "user.profile.request";
pub const USER_RSS_SUBSCRIPTIONS_SUBJECT: &str = "user.rss.subscriptions";

const DURABLE_CONSUMER_NAME: &str = "repository-rpc";

pub struct RepositoryRpc {
    repository: Arc<dyn Repository>,
    broker: Broker,
}

impl RepositoryRpc {
    pub fn new(repository: Arc<dyn Repository>, broker: Broker) -> Self {
        Self { repository, broker }
    }

    /// Spawn one task per queue/subject named in spec.md §6. Every task
    /// runs until `cancellation` fires.
    pub fn spawn_all(self: Arc<Self>, cancellation: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(self.clone().run_create_user(cancellation.clone())));
        handles.push(tokio::spawn(
            self.clone().run_update_preferences(cancellation.clone()),
        ));
        handles.push(tokio::spawn(
            self.clone().run_update_antipathy(cancellation.clone()),
        ));
        handles.push(tokio::spawn(self.clone().run_set_status(cancellation.clone())));
        handles.push(tokio::spawn(self.clone().run_subscribe(cancellation.clone())));
        handles.push(tokio::spawn(self.clone().run_unsubscribe(cancellation.clone())));
        handles.push(tokio::spawn(self.clone().run_profile_requests(cancellation.clone())));
        handles.push(tokio::spawn(self.run_subscription_list_requests(cancellation)));

        handles
    }

    async fn run_create_user(self: Arc<Self>, cancellation: CancellationToken) {
        self.consume_queue(USER_CREATE_QUEUE, cancellation, |rpc, payload: CreateUserRequest| {
            let rpc = rpc.clone();
            async move {
                rpc.repository.create_user(payload.user_id, &payload.username).await?;
                REQUESTS_TOTAL.with_label_values(&[STAGE, "created_user"]).inc();
                Ok(())
            }
        })
        .await;
    }

    async fn run_update_preferences(self: Arc<Self>, cancellation: CancellationToken) {
        self.consume_queue(
            USER_PREFERENCES_UPDATE_QUEUE,
            cancellation,
            |rpc, payload: UpdatePreferencesRequest| {
                let rpc = rpc.clone();
                async move {
                    rpc.repository.update_preferences(payload.user_id, &payload.preferences).await?;
                    Ok(())
                }
            },
        )
        .await;
    }

    async fn run_update_antipathy(self: Arc<Self>, cancellation: CancellationToken) {
        self.consume_queue(
            USER_ANTIPATHY_UPDATE_QUEUE,
            cancellation,
            |rpc, payload: UpdateAntipathyRequest| {
                let rpc = rpc.clone();
                async move {
                    rpc.repository.update_antipathy(payload.user_id, &payload.antipathy).await?;
                    Ok(())
                }
            },
        )
        .await;
    }

    async fn run_set_status(self: Arc<Self>, cancellation: CancellationToken) {
        self.consume_queue(
            USER_SET_STATUS_ID_QUEUE,
            cancellation,
            |rpc, payload: SetStatusRequest| {
                let rpc = rpc.clone();
                async move {
                    let is_pro = matches!(payload.status, AccountStatus::Pro);
                    rpc.repository.set_status(payload.user_id, is_pro).await?;

                    let notification = StatusNotification {
                        user_id: payload.user_id,
                        status: payload.status,
                        correlation_id: payload.correlation_id.clone(),
                    };
                    if let Err(e) = rpc
                        .broker
                        .publish(USER_STATUS_NOTIFICATION_SUBJECT, &notification)
                        .await
                    {
                        warn!(error = %e, "failed to publish status notification");
                    }
                    Ok(())
                }
            },
        )
        .await;
    }

    async fn run_subscribe(self: Arc<Self>, cancellation: CancellationToken) {
        self.consume_queue(
            RSS_FEED_SUBSCRIBE_QUEUE,
            cancellation,
            |rpc, payload: SubscribeFeedRequest| {
                let rpc = rpc.clone();
                async move {
                    let feed = rpc.repository.get_or_create_feed(&payload.feed_url).await?;
                    rpc.repository.add_subscription(payload.user_id, feed.id).await?;
                    REQUESTS_TOTAL.with_label_values(&[STAGE, "added_feed"]).inc();
                    Ok(())
                }
            },
        )
        .await;
    }

    async fn run_unsubscribe(self: Arc<Self>, cancellation: CancellationToken) {
        self.consume_queue(
            RSS_FEED_UNSUBSCRIBE_QUEUE,
            cancellation,
            |rpc, payload: UnsubscribeFeedRequest| {
                let rpc = rpc.clone();
                async move {
                    rpc.repository.remove_subscription(payload.user_id, &payload.feed_url).await?;
                    Ok(())
                }
            },
        )
        .await;
    }

    async fn run_profile_requests(self: Arc<Self>, cancellation: CancellationToken) {
        let mut subscriber = match self.broker.service_requests(USER_PROFILE_REQUEST_SUBJECT).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to subscribe to profile request subject");
                return;
            }
        };

        loop {
            let message = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                m = subscriber.next() => m,
            };
            let Some(message) = message else { break };
            let Some(reply) = message.reply.clone() else {
                warn!("profile request had no reply subject, dropping");
                continue;
            };

            let reply_payload = match serde_json::from_slice::<ProfileRequest>(&message.payload) {
                Ok(req) => match self.repository.get_user(req.user_id).await {
                    Ok(Some(user)) => ProfileReply::Success {
                        data: ProfileData::from(&user),
                    },
                    Ok(None) => ProfileReply::Error {
                        message: format!("user {} not found", req.user_id),
                    },
                    Err(e) => ProfileReply::Error { message: e.to_string() },
                },
                Err(e) => ProfileReply::Error {
                    message: format!("malformed request: {e}"),
                },
            };

            if let Err(e) = self.broker.reply(&reply, &reply_payload).await {
                warn!(error = %e, "failed to publish profile reply");
            }
        }
    }

    async fn run_subscription_list_requests(self: Arc<Self>, cancellation: CancellationToken) {
        let mut subscriber = match self.broker.service_requests(USER_RSS_SUBSCRIPTIONS_SUBJECT).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to subscribe to subscription list subject");
                return;
            }
        };

        loop {
            let message = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                m = subscriber.next() => m,
            };
            let Some(message) = message else { break };
            let Some(reply) = message.reply.clone() else {
                warn!("subscription list request had no reply subject, dropping");
                continue;
            };

            let urls = match serde_json::from_slice::<SubscriptionListRequest>(&message.payload) {
                Ok(req) => self.repository.get_subscription_urls(req.user_id).await.unwrap_or_default(),
                Err(e) => {
                    warn!(error = %e, "malformed subscription list request");
                    Vec::new()
                }
            };

            if let Err(e) = self.broker.reply(&reply, &SubscriptionListReply { urls }).await {
                warn!(error = %e, "failed to publish subscription list reply");
            }
        }
    }

    /// Drain a durable JetStream queue, acking only after the handler
    /// commits successfully (spec.md §5 broker discipline). A transient
    /// repository error leaves the message unacked for redelivery; any
    /// other error is logged and acked so a poison message cannot wedge
    /// the consumer.
    async fn consume_queue<T, F, Fut>(
        self: Arc<Self>,
        queue: &str,
        cancellation: CancellationToken,
        handler: F,
    ) where
        T: serde::de::DeserializeOwned,
        F: Fn(Arc<Self>, T) -> Fut,
        Fut: std::future::Future<Output = crate::error::PipelineResult<()>>,
    {
        let consumer = match self.broker.consumer(queue, DURABLE_CONSUMER_NAME).await {
            Ok(c) => c,
            Err(e) => {
                warn!(queue, error = %e, "failed to bind durable consumer");
                return;
            }
        };

        let mut messages = match consumer.messages().await {
            Ok(m) => m,
            Err(e) => {
                warn!(queue, error = %e, "failed to start consuming");
                return;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                m = messages.next() => m,
            };
            let Some(message) = next else { break };
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    warn!(queue, error = %e, "consumer error");
                    continue;
                }
            };

            let payload: T = match serde_json::from_slice(&message.payload) {
                Ok(v) => v,
                Err(e) => {
                    ERRORS_TOTAL.with_label_values(&[STAGE, "malformed_input"]).inc();
                    error!(queue, error = %e, "malformed payload, acking to drop");
                    let _ = message.ack().await;
                    continue;
                }
            };

            REQUESTS_TOTAL.with_label_values(&[STAGE, queue]).inc();
            match handler(self.clone(), payload).await {
                Ok(()) => {
                    if let Err(e) = message.ack().await {
                        warn!(queue, error = %e, "ack failed");
                    } else {
                        info!(queue, "handled and acked message");
                    }
                }
                Err(e) if e.should_ack() => {
                    ERRORS_TOTAL.with_label_values(&[STAGE, e.metric_label()]).inc();
                    // Ack-on-drop errors still differ in log level per spec.md §7:
                    // MalformedInput at error, NotFound at info (treated as
                    // success), everything else at warn.
                    match &e {
                        PipelineError::MalformedInput(_) => {
                            error!(queue, error = %e, "handler error, acking (no retry)");
                        }
                        PipelineError::NotFound(_) => {
                            info!(queue, error = %e, "not found, treated as success, acking");
                        }
                        _ => {
                            warn!(queue, error = %e, "handler error, acking (no retry)");
                        }
                    }
                    let _ = message.ack().await;
                }
                Err(e) => {
                    ERRORS_TOTAL.with_label_values(&[STAGE, e.metric_label()]).inc();
                    warn!(queue, error = %e, "transient handler error, leaving unacked for redelivery");
                }
            }
        }
    }
}
