//! Summary Writer: turns a `RelevantPost` into a short personalized
//! summary and emits `ReadyPost` (spec.md §4.3).
//!
//! Grounded on `original_source/services/writer/ai_writer.py`'s `Writer`
//! class: its own `AsyncLimiter(3, 1)` becomes the writer's
//! [`RateLimiter`](crate::rate_limiter::RateLimiter), and the
//! `OutputParserException` catch around the `News` pydantic model becomes
//! `ModelOutput` classification at the `WritingModel` boundary — a failed
//! parse drops the message rather than retrying, since a repeat costs
//! model spend without better odds of success.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::broker::Broker;
use crate::config::Config;
use crate::domain::{ReadyPost, RelevantPost};
use crate::error::PipelineResult;
use crate::metrics::{ERRORS_TOTAL, OPERATION_DURATION_SECONDS, REQUESTS_TOTAL};
use crate::model_client::WritingModel;
use crate::rate_limiter::RateLimiter;

pub const READY_POSTS_SUBJECT: &str = "rss.ready_posts";
const STAGE: &str = "writer";

pub struct Writer {
    broker: Broker,
    model: Arc<dyn WritingModel>,
    limiter: RateLimiter,
}

impl Writer {
    pub fn new(broker: Broker, model: Arc<dyn WritingModel>, config: &Config) -> Self {
        Self {
            broker,
            model,
            limiter: RateLimiter::new(config.writer_rate_limit_per_sec),
        }
    }

    /// One `RelevantPost` yields at most one `ReadyPost` (spec.md §4.3
    /// invariant). A model-output failure is logged and the message is
    /// dropped (acked), never retried.
    #[instrument(skip(self, event), fields(correlation_id = %event.correlation_id, user_id = event.user_id))]
    pub async fn handle(&self, event: RelevantPost) -> PipelineResult<()> {
        REQUESTS_TOTAL.with_label_values(&[STAGE, "relevant_post"]).inc();
        let _timer = OPERATION_DURATION_SECONDS
            .with_label_values(&[STAGE, "relevant_post"])
            .start_timer();

        self.limiter.acquire().await;

        let post_text = format!("{}\n\n{}", event.post_title, event.post_content);
        let news = match self.model.write(&event.preferences, &post_text).await {
            Ok(n) => n,
            Err(e) => {
                ERRORS_TOTAL.with_label_values(&[STAGE, e.metric_label()]).inc();
                warn!(error = %e, "writing model failed, dropping relevant post");
                return Ok(());
            }
        };

        let ready = ReadyPost {
            user_id: event.user_id,
            news,
            post_url: event.post_link.clone(),
            feed_url: event.feed_url.clone(),
            rank: event.rank,
            correlation_id: event.correlation_id.clone(),
        };

        match self.broker.publish(READY_POSTS_SUBJECT, &ready).await {
            Ok(()) => {
                REQUESTS_TOTAL.with_label_values(&[STAGE, "summary"]).inc();
                info!("emitted ready post");
            }
            Err(e) => {
                ERRORS_TOTAL.with_label_values(&[STAGE, "transient_fetch"]).inc();
                warn!(error = %e, "failed to publish ready post");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FailingWritingModel;

    #[async_trait]
    impl WritingModel for FailingWritingModel {
        async fn write(&self, _: &str, _: &str) -> PipelineResult<String> {
            Err(crate::error::PipelineError::ModelOutput("bad json".into()))
        }
    }

    struct EchoWritingModel;

    #[async_trait]
    impl WritingModel for EchoWritingModel {
        async fn write(&self, preferences: &str, _: &str) -> PipelineResult<String> {
            Ok(format!("summary for {preferences}"))
        }
    }

    #[tokio::test]
    async fn model_output_error_is_treated_as_a_drop_not_a_requeue() {
        let model = FailingWritingModel;
        let result = model.write("prefs", "text").await;
        assert!(result.is_err());
        // Writer::handle maps this error to Ok(()) (ack, no retry) — see handle().
    }

    #[tokio::test]
    async fn successful_write_produces_expected_summary_text() {
        let model = EchoWritingModel;
        let news = model.write("rust and databases", "post").await.unwrap();
        assert_eq!(news, "summary for rust and databases");
    }
}
