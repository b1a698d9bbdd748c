//! The transactional repository of users, feeds, posts, and subscriptions
//! (spec.md §3, §6). Treated as an external collaborator by the spec, but
//! the pipeline needs a concrete client for it; this module is that client.
//!
//! `Repository` is a trait so every stage can be tested against
//! `InMemoryRepository` without a live Postgres instance (spec.md's own
//! test-tooling guidance, `SPEC_FULL.md` §1). `PgRepository` is the
//! production implementation, grounded on
//! `original_source/services/{rss_manager,user_manager}/managers.py`: every
//! method here is a direct translation of one Python handler method's SQL
//! logic (add_feed ~ `add_feed`, add_subscription ~ `add_subscription`,
//! delete_subscription ~ `delete_subscription` + its cascading feed
//! deletion, etc).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{Feed, Post, Subscription, User};
use crate::error::{PipelineError, PipelineResult};

#[async_trait]
pub trait Repository: Send + Sync {
    // ---- users ----

    /// Idempotent on `user_id` (spec.md §4.5).
    async fn create_user(&self, user_id: i64, username: &str) -> PipelineResult<()>;

    async fn get_user(&self, user_id: i64) -> PipelineResult<Option<User>>;

    async fn update_preferences(&self, user_id: i64, preferences: &str) -> PipelineResult<()>;

    async fn update_antipathy(&self, user_id: i64, antipathy: &str) -> PipelineResult<()>;

    /// Idempotent on `(user_id, is_pro)` (spec.md §4.5).
    async fn set_status(&self, user_id: i64, is_pro: bool) -> PipelineResult<()>;

    // ---- feeds ----

    async fn get_feed(&self, feed_id: Uuid) -> PipelineResult<Option<Feed>>;

    async fn get_feed_by_url(&self, url: &str) -> PipelineResult<Option<Feed>>;

    async fn list_feeds(&self) -> PipelineResult<Vec<Feed>>;

    /// Returns the existing feed row for `url`, creating one if absent.
    async fn get_or_create_feed(&self, url: &str) -> PipelineResult<Feed>;

    /// Advance the watermark to `new_last_post_date` if it is greater than
    /// the current value, serialized per feed (spec.md §3, §5).
    async fn advance_watermark(
        &self,
        feed_id: Uuid,
        new_last_post_date: DateTime<Utc>,
    ) -> PipelineResult<()>;

    async fn delete_feed(&self, feed_id: Uuid) -> PipelineResult<()>;

    // ---- posts ----

    /// Persist a post discovered past the feed's watermark (spec.md §3:
    /// "Created by the Feed Poller when an entry's published time strictly
    /// exceeds the feed's watermark. Immutable thereafter").
    async fn insert_post(&self, post: &Post) -> PipelineResult<()>;

    // ---- subscriptions ----

    /// Idempotent on `(user_id, feed_id)` (spec.md §3 uniqueness invariant).
    async fn add_subscription(&self, user_id: i64, feed_id: Uuid) -> PipelineResult<()>;

    /// Idempotent; if the feed's subscriber count drops to zero, the feed
    /// row is deleted in the same transactional unit (spec.md §4.5, S6).
    async fn remove_subscription(&self, user_id: i64, feed_url: &str) -> PipelineResult<()>;

    async fn get_subscribers(&self, feed_id: Uuid) -> PipelineResult<Vec<i64>>;

    async fn get_subscription_urls(&self, user_id: i64) -> PipelineResult<Vec<String>>;

    async fn count_subscriptions(&self, feed_id: Uuid) -> PipelineResult<i64>;
}

/// Production repository, backed by PostgreSQL via `sqlx`. Queries are
/// runtime-checked (`sqlx::query`/`query_as`, never the `query!` macro) so
/// the crate compiles without a live database.
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> PipelineResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| PipelineError::Fatal(anyhow::anyhow!(e)))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::Fatal(anyhow::anyhow!(e)))?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn create_user(&self, user_id: i64, username: &str) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO users (user_id, username) VALUES ($1, $2)
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(username)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_user(&self, user_id: i64) -> PipelineResult<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn update_preferences(&self, user_id: i64, preferences: &str) -> PipelineResult<()> {
        let result = sqlx::query("UPDATE users SET preferences = $1 WHERE user_id = $2")
            .bind(preferences)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    async fn update_antipathy(&self, user_id: i64, antipathy: &str) -> PipelineResult<()> {
        let result = sqlx::query("UPDATE users SET antipathies = $1 WHERE user_id = $2")
            .bind(antipathy)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    async fn set_status(&self, user_id: i64, is_pro: bool) -> PipelineResult<()> {
        let result = sqlx::query("UPDATE users SET is_pro = $1 WHERE user_id = $2")
            .bind(is_pro)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    async fn get_feed(&self, feed_id: Uuid) -> PipelineResult<Option<Feed>> {
        sqlx::query_as::<_, Feed>("SELECT * FROM rss_feeds WHERE id = $1")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn get_feed_by_url(&self, url: &str) -> PipelineResult<Option<Feed>> {
        sqlx::query_as::<_, Feed>("SELECT * FROM rss_feeds WHERE url = $1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn list_feeds(&self) -> PipelineResult<Vec<Feed>> {
        sqlx::query_as::<_, Feed>("SELECT * FROM rss_feeds")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn get_or_create_feed(&self, url: &str) -> PipelineResult<Feed> {
        if let Some(feed) = self.get_feed_by_url(url).await? {
            return Ok(feed);
        }
        sqlx::query_as::<_, Feed>(
            "INSERT INTO rss_feeds (id, url) VALUES ($1, $2)
             ON CONFLICT (url) DO UPDATE SET url = EXCLUDED.url
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(url)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn advance_watermark(
        &self,
        feed_id: Uuid,
        new_last_post_date: DateTime<Utc>,
    ) -> PipelineResult<()> {
        sqlx::query(
            "UPDATE rss_feeds SET last_post_date = $1
             WHERE id = $2 AND (last_post_date IS NULL OR last_post_date < $1)",
        )
        .bind(new_last_post_date)
        .bind(feed_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_feed(&self, feed_id: Uuid) -> PipelineResult<()> {
        sqlx::query("DELETE FROM rss_feeds WHERE id = $1")
            .bind(feed_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_post(&self, post: &Post) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO rss_posts (id, feed_id, title, content, link, published_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(post.id)
        .bind(post.feed_id)
        .bind(&post.title)
        .bind(&post.content)
        .bind(&post.link)
        .bind(post.published_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn add_subscription(&self, user_id: i64, feed_id: Uuid) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO subscriptions (id, user_id, feed_id) VALUES ($1, $2, $3)
             ON CONFLICT (user_id, feed_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(feed_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove_subscription(&self, user_id: i64, feed_url: &str) -> PipelineResult<()> {
        let Some(feed) = self.get_feed_by_url(feed_url).await? else {
            // Unsubscribing an absent pair is a no-op (spec.md §3).
            return Ok(());
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM subscriptions WHERE user_id = $1 AND feed_id = $2")
            .bind(user_id)
            .bind(feed.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE feed_id = $1")
            .bind(feed.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

        if remaining == 0 {
            sqlx::query("DELETE FROM rss_feeds WHERE id = $1")
                .bind(feed.id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_subscribers(&self, feed_id: Uuid) -> PipelineResult<Vec<i64>> {
        sqlx::query_scalar("SELECT user_id FROM subscriptions WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn get_subscription_urls(&self, user_id: i64) -> PipelineResult<Vec<String>> {
        sqlx::query_scalar(
            "SELECT f.url FROM rss_feeds f
             JOIN subscriptions s ON s.feed_id = f.id
             WHERE s.user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn count_subscriptions(&self, feed_id: Uuid) -> PipelineResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE feed_id = $1")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }
}

fn db_err(e: sqlx::Error) -> PipelineError {
    PipelineError::TransientFetch(anyhow::anyhow!(e))
}

/// In-memory test double implementing the same invariants (uniqueness,
/// idempotency, cascading feed deletion) as `PgRepository`, used by the
/// property and scenario tests in `SPEC_FULL.md` §8.
#[cfg(any(test, feature = "test-support"))]
pub mod in_memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct State {
        users: HashMap<i64, User>,
        feeds: HashMap<Uuid, Feed>,
        posts: HashMap<Uuid, Post>,
        subscriptions: Vec<Subscription>,
    }

    #[derive(Default)]
    pub struct InMemoryRepository {
        state: Mutex<State>,
    }

    impl InMemoryRepository {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Repository for InMemoryRepository {
        async fn create_user(&self, user_id: i64, username: &str) -> PipelineResult<()> {
            let mut state = self.state.lock().await;
            state.users.entry(user_id).or_insert_with(|| User {
                user_id,
                username: username.to_string(),
                created_at: Utc::now(),
                is_pro: false,
                preferences: String::new(),
                antipathies: String::new(),
            });
            Ok(())
        }

        async fn get_user(&self, user_id: i64) -> PipelineResult<Option<User>> {
            Ok(self.state.lock().await.users.get(&user_id).cloned())
        }

        async fn update_preferences(&self, user_id: i64, preferences: &str) -> PipelineResult<()> {
            let mut state = self.state.lock().await;
            match state.users.get_mut(&user_id) {
                Some(u) => {
                    u.preferences = preferences.to_string();
                    Ok(())
                }
                None => Err(PipelineError::NotFound(format!("user {user_id}"))),
            }
        }

        async fn update_antipathy(&self, user_id: i64, antipathy: &str) -> PipelineResult<()> {
            let mut state = self.state.lock().await;
            match state.users.get_mut(&user_id) {
                Some(u) => {
                    u.antipathies = antipathy.to_string();
                    Ok(())
                }
                None => Err(PipelineError::NotFound(format!("user {user_id}"))),
            }
        }

        async fn set_status(&self, user_id: i64, is_pro: bool) -> PipelineResult<()> {
            let mut state = self.state.lock().await;
            match state.users.get_mut(&user_id) {
                Some(u) => {
                    u.is_pro = is_pro;
                    Ok(())
                }
                None => Err(PipelineError::NotFound(format!("user {user_id}"))),
            }
        }

        async fn get_feed(&self, feed_id: Uuid) -> PipelineResult<Option<Feed>> {
            Ok(self.state.lock().await.feeds.get(&feed_id).cloned())
        }

        async fn get_feed_by_url(&self, url: &str) -> PipelineResult<Option<Feed>> {
            Ok(self
                .state
                .lock()
                .await
                .feeds
                .values()
                .find(|f| f.url == url)
                .cloned())
        }

        async fn list_feeds(&self) -> PipelineResult<Vec<Feed>> {
            Ok(self.state.lock().await.feeds.values().cloned().collect())
        }

        async fn get_or_create_feed(&self, url: &str) -> PipelineResult<Feed> {
            let mut state = self.state.lock().await;
            if let Some(feed) = state.feeds.values().find(|f| f.url == url) {
                return Ok(feed.clone());
            }
            let feed = Feed {
                id: Uuid::new_v4(),
                url: url.to_string(),
                created_at: Utc::now(),
                last_post_date: None,
            };
            state.feeds.insert(feed.id, feed.clone());
            Ok(feed)
        }

        async fn advance_watermark(
            &self,
            feed_id: Uuid,
            new_last_post_date: DateTime<Utc>,
        ) -> PipelineResult<()> {
            let mut state = self.state.lock().await;
            if let Some(feed) = state.feeds.get_mut(&feed_id) {
                if feed.last_post_date.map_or(true, |d| d < new_last_post_date) {
                    feed.last_post_date = Some(new_last_post_date);
                }
            }
            Ok(())
        }

        async fn delete_feed(&self, feed_id: Uuid) -> PipelineResult<()> {
            self.state.lock().await.feeds.remove(&feed_id);
            Ok(())
        }

        async fn insert_post(&self, post: &Post) -> PipelineResult<()> {
            self.state.lock().await.posts.entry(post.id).or_insert_with(|| post.clone());
            Ok(())
        }

        async fn add_subscription(&self, user_id: i64, feed_id: Uuid) -> PipelineResult<()> {
            let mut state = self.state.lock().await;
            let exists = state
                .subscriptions
                .iter()
                .any(|s| s.user_id == user_id && s.feed_id == feed_id);
            if !exists {
                state.subscriptions.push(Subscription {
                    id: Uuid::new_v4(),
                    user_id,
                    feed_id,
                    created_at: Utc::now(),
                });
            }
            Ok(())
        }

        async fn remove_subscription(&self, user_id: i64, feed_url: &str) -> PipelineResult<()> {
            let mut state = self.state.lock().await;
            let Some(feed_id) = state.feeds.values().find(|f| f.url == feed_url).map(|f| f.id) else {
                return Ok(());
            };
            state
                .subscriptions
                .retain(|s| !(s.user_id == user_id && s.feed_id == feed_id));
            let remaining = state.subscriptions.iter().filter(|s| s.feed_id == feed_id).count();
            if remaining == 0 {
                state.feeds.remove(&feed_id);
            }
            Ok(())
        }

        async fn get_subscribers(&self, feed_id: Uuid) -> PipelineResult<Vec<i64>> {
            Ok(self
                .state
                .lock()
                .await
                .subscriptions
                .iter()
                .filter(|s| s.feed_id == feed_id)
                .map(|s| s.user_id)
                .collect())
        }

        async fn get_subscription_urls(&self, user_id: i64) -> PipelineResult<Vec<String>> {
            let state = self.state.lock().await;
            Ok(state
                .subscriptions
                .iter()
                .filter(|s| s.user_id == user_id)
                .filter_map(|s| state.feeds.get(&s.feed_id).map(|f| f.url.clone()))
                .collect())
        }

        async fn count_subscriptions(&self, feed_id: Uuid) -> PipelineResult<i64> {
            Ok(self
                .state
                .lock()
                .await
                .subscriptions
                .iter()
                .filter(|s| s.feed_id == feed_id)
                .count() as i64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::in_memory::InMemoryRepository;
    use super::*;

    #[tokio::test]
    async fn create_user_is_idempotent() {
        let repo = InMemoryRepository::new();
        repo.create_user(1, "a").await.unwrap();
        repo.create_user(1, "a").await.unwrap();
        let user = repo.get_user(1).await.unwrap().unwrap();
        assert_eq!(user.username, "a");
        assert!(!user.is_pro);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_unique() {
        let repo = InMemoryRepository::new();
        let feed = repo.get_or_create_feed("https://example/rss").await.unwrap();
        repo.add_subscription(1, feed.id).await.unwrap();
        repo.add_subscription(1, feed.id).await.unwrap();
        assert_eq!(repo.count_subscriptions(feed.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_deletes_feed_when_last_subscriber_leaves() {
        let repo = InMemoryRepository::new();
        let feed = repo.get_or_create_feed("https://example/rss").await.unwrap();
        repo.add_subscription(1, feed.id).await.unwrap();

        repo.remove_subscription(1, "https://example/rss").await.unwrap();

        assert!(repo.get_feed(feed.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_absent_pair_is_a_no_op() {
        let repo = InMemoryRepository::new();
        // No feed, no subscription exists yet; must not error.
        repo.remove_subscription(1, "https://example/rss").await.unwrap();
    }

    #[tokio::test]
    async fn watermark_is_monotonically_non_decreasing() {
        use chrono::TimeZone;

        let repo = InMemoryRepository::new();
        let feed = repo.get_or_create_feed("https://example/rss").await.unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 3, 9, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();

        repo.advance_watermark(feed.id, later).await.unwrap();
        repo.advance_watermark(feed.id, earlier).await.unwrap();

        let feed = repo.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(feed.last_post_date, Some(later));
    }
}
