//! Entities and wire payloads from `SPEC_FULL.md` §3 and §6.
//!
//! Grounded on `original_source/shared/postgresql/models.py` and
//! `original_source/services/{rss_manager,user_manager}/database/models.py`
//! for the entity shapes, and on the queue payload table in spec.md §6 for
//! the event structs. Every payload is an explicit typed schema rather than
//! an open JSON map, per spec.md §9's redesign note: unknown fields are
//! ignored by `serde`, missing required fields surface as
//! `PipelineError::MalformedInput` at the deserialization boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A polled RSS/Atom source. Identity is a UUID; `last_post_date` is the
/// deduplication watermark (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Feed {
    pub id: Uuid,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub last_post_date: Option<DateTime<Utc>>,
}

/// One entry within a feed, persisted once its `published_at` clears the
/// feed's watermark. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub title: String,
    pub content: String,
    pub link: String,
    pub published_at: DateTime<Utc>,
}

/// An end user, identified by the numeric ID the front-end assigns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub is_pro: bool,
    pub preferences: String,
    pub antipathies: String,
}

/// A (user, feed) subscription. At most one row per pair (spec.md §3 (iv)).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: i64,
    pub feed_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// `rss.new_posts` — emitted once per newly discovered entry, fanned out to
/// every subscriber captured at emission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPost {
    pub published_at: DateTime<Utc>,
    pub feed_url: String,
    pub post_title: String,
    pub post_link: String,
    pub post_content: String,
    pub feed_subscribers: Vec<i64>,
    pub correlation_id: String,
}

/// `rss.relevant_posts` — one per (post, user) pair that cleared the
/// relevance threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevantPost {
    pub feed_url: String,
    pub post_title: String,
    pub post_link: String,
    pub post_content: String,
    pub user_id: i64,
    pub preferences: String,
    pub rank: i32,
    pub correlation_id: String,
}

/// `rss.ready_posts` — a finished, personalized summary ready for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPost {
    pub user_id: i64,
    pub news: String,
    pub post_url: String,
    pub feed_url: String,
    pub rank: i32,
    pub correlation_id: String,
}

/// `user.status.notification` — fire-and-forget notice that a user's status
/// changed, routed to the delivery path so the (out-of-scope) front-end can
/// tell the user about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusNotification {
    pub user_id: i64,
    pub status: AccountStatus,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Pro,
    Free,
}

// ---------- Repository RPC payloads (spec.md §6) ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub user_id: i64,
    pub username: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePreferencesRequest {
    pub user_id: i64,
    pub preferences: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAntipathyRequest {
    pub user_id: i64,
    pub antipathy: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusRequest {
    pub user_id: i64,
    pub status: AccountStatus,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeFeedRequest {
    pub user_id: i64,
    pub feed_url: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeFeedRequest {
    pub user_id: i64,
    pub feed_url: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRequest {
    pub user_id: i64,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileData {
    pub user_id: i64,
    pub username: String,
    pub is_pro: bool,
    pub preferences: String,
    pub antipathies: String,
}

/// Reply envelope for `user.profile.request`. An explicit enum instead of
/// an open `{status, ...}` map, per spec.md §9's redesign note.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProfileReply {
    Success { data: ProfileData },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionListRequest {
    pub user_id: i64,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionListReply {
    pub urls: Vec<String>,
}

impl From<&User> for ProfileData {
    fn from(u: &User) -> Self {
        ProfileData {
            user_id: u.user_id,
            username: u.username.clone(),
            is_pro: u.is_pro,
            preferences: u.preferences.clone(),
            antipathies: u.antipathies.clone(),
        }
    }
}
