//! Delivery Router: a per-user paced mailbox that serializes delivery to
//! each user and enforces a minimum spacing between successive sends
//! (spec.md §4.4).
//!
//! Grounded on `original_source/services/tg_bot/main.py`: `user_queues` +
//! `queue_lock` become `Mutex<HashMap<i64, mpsc::Sender<ReadyPost>>>` here;
//! `process_user_queue`'s `try/finally: await asyncio.sleep(...)` becomes
//! the unconditional `sleep(pacing_interval)` after every send attempt
//! below; `enqueue_message`'s lazy-create-under-lock becomes
//! `Delivery::dispatch`; `on_shutdown`'s task cancellation becomes the
//! `CancellationToken` threaded into every delivery task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::ReadyPost;

/// The outbound send itself is an external collaborator (the front-end
/// surface is explicitly out of scope, spec.md §1 Non-goals); this trait is
/// the seam a concrete front-end integration would implement.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn send(&self, post: &ReadyPost) -> anyhow::Result<()>;
}

const MAILBOX_CAPACITY: usize = 64;

struct Mailbox {
    sender: mpsc::Sender<ReadyPost>,
}

/// Process-local `user_id -> mailbox` map plus the per-user delivery tasks
/// that drain them. Guarded by a mutex so concurrent first-arrivals for an
/// unknown user spawn exactly one delivery task (spec.md §4.4, §5).
pub struct DeliveryRouter {
    mailboxes: Mutex<HashMap<i64, Mailbox>>,
    sink: Arc<dyn DeliverySink>,
    pacing_interval: std::time::Duration,
    cancellation: CancellationToken,
}

impl DeliveryRouter {
    pub fn new(sink: Arc<dyn DeliverySink>, pacing_interval: std::time::Duration) -> Self {
        Self {
            mailboxes: Mutex::new(HashMap::new()),
            sink,
            pacing_interval,
            cancellation: CancellationToken::new(),
        }
    }

    /// Route a `ReadyPost` to its addressee's mailbox, lazily creating the
    /// mailbox and its delivery task on first arrival for that user.
    #[instrument(skip(self, post), fields(user_id = post.user_id, correlation_id = %post.correlation_id))]
    pub async fn dispatch(&self, post: ReadyPost) {
        let sender = {
            let mut mailboxes = self.mailboxes.lock().await;
            let mailbox = mailboxes.entry(post.user_id).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
                let sink = self.sink.clone();
                let pacing_interval = self.pacing_interval;
                let cancellation = self.cancellation.clone();
                let user_id = post.user_id;
                tokio::spawn(delivery_task(user_id, rx, sink, pacing_interval, cancellation));
                Mailbox { sender: tx }
            });
            mailbox.sender.clone()
        };

        if let Err(e) = sender.send(post).await {
            warn!(error = %e, "mailbox send failed, receiver must have been dropped during shutdown");
        }
    }

    /// Cooperatively cancel every delivery task. In-flight mailbox entries
    /// are discarded; at-most-once is not promised for them (spec.md §4.4).
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }
}

async fn delivery_task(
    user_id: i64,
    mut rx: mpsc::Receiver<ReadyPost>,
    sink: Arc<dyn DeliverySink>,
    pacing_interval: std::time::Duration,
    cancellation: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            msg = rx.recv() => msg,
        };
        let Some(post) = next else { break };

        if let Err(e) = sink.send(&post).await {
            warn!(user_id, error = %e, "delivery send failed, not retried");
        } else {
            info!(user_id, correlation_id = %post.correlation_id, "delivered post");
        }

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            _ = tokio::time::sleep(pacing_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSink {
        sent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeliverySink for CountingSink {
        async fn send(&self, _post: &ReadyPost) -> anyhow::Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_post(user_id: i64) -> ReadyPost {
        ReadyPost {
            user_id,
            news: "summary".into(),
            post_url: "https://example/post".into(),
            feed_url: "https://example/rss".into(),
            rank: 80,
            correlation_id: "corr-1".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_delays_the_second_delivery_to_the_same_user() {
        let sent = Arc::new(AtomicUsize::new(0));
        let router = DeliveryRouter::new(
            Arc::new(CountingSink { sent: sent.clone() }),
            Duration::from_secs(5),
        );

        router.dispatch(sample_post(1)).await;
        router.dispatch(sample_post(1)).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 1, "second send must wait out the pacing interval");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 2);

        router.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_users_are_not_paced_against_each_other() {
        let sent = Arc::new(AtomicUsize::new(0));
        let router = DeliveryRouter::new(
            Arc::new(CountingSink { sent: sent.clone() }),
            Duration::from_secs(5),
        );

        router.dispatch(sample_post(1)).await;
        router.dispatch(sample_post(2)).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 2);

        router.shutdown();
    }
}
