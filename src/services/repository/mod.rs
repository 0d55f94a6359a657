//! Data access for the feed pipeline
//!
//! The pipeline never talks to a database handle directly: every read goes
//! through [`FeedRepository`] and every profile write through [`ProfileCache`],
//! both injected at construction. `postgres` is the production backend and
//! `memory` backs tests and local runs.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    models::{
        Document, FeedEntry, FeedKey, InteractionHistory, RecentEngagement, User, UserFilter,
        WordFrequencyProfile,
    },
    services::batch_writer::{BatchUpdateSpec, RecordRef},
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::PgFeedRepository;

/// Collection persisted feeds are written to
pub const USER_FEEDS_COLLECTION: &str = "user_feeds";

/// Window for the most recent bet attached to a feed entry
pub const RECENT_BET_WINDOW_DAYS: i64 = 1;
/// Window and count for the comments attached to a feed entry
pub const RECENT_COMMENT_WINDOW_DAYS: i64 = 3;
pub const RECENT_COMMENT_LIMIT: usize = 3;

/// Read side of the pipeline's persistence layer
#[async_trait::async_trait]
pub trait FeedRepository: Send + Sync {
    /// Open documents eligible for feeds
    ///
    /// Each call starts a fresh sequence; pages are fetched lazily as the
    /// stream is polled.
    fn candidate_documents(&self) -> BoxStream<'_, AppResult<Document>>;

    /// Documents by id regardless of status, for building history profiles
    async fn documents_by_ids(&self, ids: &[String]) -> AppResult<Vec<Document>>;

    async fn users(&self, filter: &UserFilter) -> AppResult<Vec<User>>;

    async fn interaction_history(&self, user_id: &str) -> AppResult<InteractionHistory>;

    /// Latest bet within a day and up to three comments within three days of `now`
    async fn recent_engagement(
        &self,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<RecentEngagement>;

    /// A previously persisted feed, if one exists
    async fn user_feed(&self, key: &FeedKey) -> AppResult<Option<Vec<FeedEntry>>>;

    /// Backend name, logged when a run reads its inputs
    fn name(&self) -> &'static str;
}

/// Optional materialized copy of each user's word-frequency profile
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ProfileCache: Send + Sync {
    /// Replaces any previously stored profile for the user
    async fn store_profile(&self, user_id: &str, profile: &WordFrequencyProfile) -> AppResult<()>;

    async fn load_profile(&self, user_id: &str) -> AppResult<Option<WordFrequencyProfile>>;
}

/// Update that replaces the persisted feed behind `key`
pub fn feed_update(key: &FeedKey, entries: &[FeedEntry]) -> AppResult<BatchUpdateSpec> {
    let mut fields = Map::new();
    fields.insert("user_id".to_string(), json!(key.user_id));
    fields.insert("category".to_string(), json!(key.category));
    fields.insert("entries".to_string(), serde_json::to_value(entries)?);

    Ok(BatchUpdateSpec {
        target: RecordRef::new(USER_FEEDS_COLLECTION, key.to_string()),
        fields,
    })
}

/// Reads the entries back out of a persisted feed record
pub fn feed_entries(fields: &Map<String, Value>) -> AppResult<Vec<FeedEntry>> {
    let entries = fields
        .get("entries")
        .cloned()
        .ok_or_else(|| AppError::Internal("Feed record has no entries field".to_string()))?;
    Ok(serde_json::from_value(entries)?)
}
