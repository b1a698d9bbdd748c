//! Relevance Scorer: consumes `NewPost`, scores it against every
//! subscriber's preferences, and forwards qualifying pairs (spec.md §4.2).
//!
//! Grounded on `original_source/services/content_validator/ranker.py`'s
//! `Ranker` class: the `AsyncLimiter(5, 1)` token bucket becomes
//! [`RateLimiter`](crate::rate_limiter::RateLimiter), the freshness check
//! (`published_at.date() != current_time.date()`) is reproduced verbatim as
//! a same-UTC-day gate, and the per-subscriber loop that reads
//! `(preferences, antipathies)` before calling the model is unchanged in
//! shape.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::broker::Broker;
use crate::config::Config;
use crate::domain::{NewPost, RelevantPost};
use crate::metrics::{ERRORS_TOTAL, OPERATION_DURATION_SECONDS, REQUESTS_TOTAL};
use crate::model_client::ScoringModel;
use crate::rate_limiter::RateLimiter;
use crate::repository::Repository;

pub const RELEVANT_POSTS_SUBJECT: &str = "rss.relevant_posts";
const STAGE: &str = "scorer";

pub struct Scorer {
    repository: Arc<dyn Repository>,
    broker: Broker,
    model: Arc<dyn ScoringModel>,
    limiter: RateLimiter,
    threshold: i32,
}

impl Scorer {
    pub fn new(
        repository: Arc<dyn Repository>,
        broker: Broker,
        model: Arc<dyn ScoringModel>,
        config: &Config,
    ) -> Self {
        Self {
            repository,
            broker,
            model,
            limiter: RateLimiter::new(config.scorer_rate_limit_per_sec),
            threshold: config.relevance_threshold,
        }
    }

    /// Handle one `NewPost`. Returns `Ok(())` when the message should be
    /// acked; an error classifies whether the caller should nak instead
    /// (`PipelineError::should_ack`, spec.md §4.2 failure semantics).
    #[instrument(skip(self, event), fields(correlation_id = %event.correlation_id))]
    pub async fn handle(&self, event: NewPost) -> crate::error::PipelineResult<()> {
        REQUESTS_TOTAL.with_label_values(&[STAGE, "new_post"]).inc();
        let _timer = OPERATION_DURATION_SECONDS
            .with_label_values(&[STAGE, "new_post"])
            .start_timer();

        if !published_today(&event) {
            info!(published_at = %event.published_at, "dropping stale post, outside freshness gate");
            return Ok(());
        }

        for user_id in &event.feed_subscribers {
            let user = match self.repository.get_user(*user_id).await {
                Ok(Some(u)) => u,
                Ok(None) => continue,
                Err(e) => {
                    ERRORS_TOTAL.with_label_values(&[STAGE, e.metric_label()]).inc();
                    warn!(user_id, error = %e, "repository read failed, requeueing whole event");
                    return Err(e);
                }
            };

            self.limiter.acquire().await;

            let post_text = format!("{}\n\n{}", event.post_title, event.post_content);
            let rank = match self.model.rank(&user.preferences, &user.antipathies, &post_text).await {
                Ok(r) => r,
                Err(e) => {
                    ERRORS_TOTAL.with_label_values(&[STAGE, e.metric_label()]).inc();
                    warn!(user_id, error = %e, "scoring model failed for subscriber, skipping");
                    continue;
                }
            };

            if rank > self.threshold {
                let relevant = RelevantPost {
                    feed_url: event.feed_url.clone(),
                    post_title: event.post_title.clone(),
                    post_link: event.post_link.clone(),
                    post_content: event.post_content.clone(),
                    user_id: *user_id,
                    preferences: user.preferences.clone(),
                    rank,
                    correlation_id: event.correlation_id.clone(),
                };
                match self.broker.publish(RELEVANT_POSTS_SUBJECT, &relevant).await {
                    Ok(()) => REQUESTS_TOTAL.with_label_values(&[STAGE, "validated_post"]).inc(),
                    Err(e) => {
                        ERRORS_TOTAL.with_label_values(&[STAGE, "transient_fetch"]).inc();
                        warn!(user_id, error = %e, "failed to publish relevant post");
                    }
                }
            }
        }

        Ok(())
    }
}

fn published_today(event: &NewPost) -> bool {
    event.published_at.date_naive() == Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::User;
    use crate::repository::in_memory::InMemoryRepository;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedScoringModel {
        rank: i32,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScoringModel for FixedScoringModel {
        async fn rank(&self, _preferences: &str, _antipathies: &str, _post_text: &str) -> crate::error::PipelineResult<i32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rank)
        }
    }

    fn sample_event(published_at: chrono::DateTime<Utc>, subscribers: Vec<i64>) -> NewPost {
        NewPost {
            published_at,
            feed_url: "https://example/rss".into(),
            post_title: "Title".into(),
            post_link: "https://example/post".into(),
            post_content: "Content".into(),
            feed_subscribers: subscribers,
            correlation_id: "corr-1".into(),
        }
    }

    #[tokio::test]
    async fn repository_reflects_preferences_read_by_the_scoring_step() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        repo.create_user(42, "bob").await.unwrap();
        repo.update_preferences(42, "rust").await.unwrap();
        let user: User = repo.get_user(42).await.unwrap().unwrap();
        assert_eq!(user.preferences, "rust");

        let model = Arc::new(FixedScoringModel {
            rank: 90,
            calls: AtomicUsize::new(0),
        });
        assert_eq!(model.rank(&user.preferences, &user.antipathies, "post").await.unwrap(), 90);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn published_today_accepts_same_utc_day_and_rejects_yesterday() {
        let now = Utc::now();
        let today = sample_event(now, vec![1]);
        assert!(published_today(&today));

        let yesterday = sample_event(now - Duration::days(1), vec![1]);
        assert!(!published_today(&yesterday));
    }
}
