//! In-process repository used by tests and local runs
//!
//! Holds the same data the Postgres tables do and records every batch commit,
//! so pipeline behaviour can be asserted without a database. Failures can be
//! injected per user or per commit.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::{
    error::{AppError, AppResult},
    models::{
        BetSnapshot, CommentSnapshot, Document, FeedEntry, FeedKey, InteractionHistory,
        RecentEngagement, User, UserFilter,
    },
    services::{
        batch_writer::{BatchCommitter, BatchUpdateSpec, RecordRef, WriteMode, MAX_BATCH_SIZE},
        repository::{
            feed_entries, FeedRepository, RECENT_BET_WINDOW_DAYS, RECENT_COMMENT_LIMIT,
            RECENT_COMMENT_WINDOW_DAYS, USER_FEEDS_COLLECTION,
        },
    },
};

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<String, Document>,
    users: Vec<User>,
    histories: HashMap<String, InteractionHistory>,
    bets: HashMap<String, Vec<BetSnapshot>>,
    comments: HashMap<String, Vec<CommentSnapshot>>,
    records: BTreeMap<RecordRef, Map<String, Value>>,
    commits: Vec<usize>,
    failing_histories: HashSet<String>,
    commit_failures: usize,
}

#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<MemoryState>,
    engagement_lookups: AtomicUsize,
    history_reads: AtomicUsize,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> AppResult<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| AppError::Internal("In-memory repository lock poisoned".to_string()))
    }

    fn write(&self) -> AppResult<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| AppError::Internal("In-memory repository lock poisoned".to_string()))
    }

    pub fn with_documents(self, documents: impl IntoIterator<Item = Document>) -> Self {
        if let Ok(mut state) = self.state.write() {
            for document in documents {
                state.documents.insert(document.id.clone(), document);
            }
        }
        self
    }

    pub fn with_users(self, users: impl IntoIterator<Item = User>) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.users.extend(users);
        }
        self
    }

    pub fn with_history(self, user_id: impl Into<String>, history: InteractionHistory) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.histories.insert(user_id.into(), history);
        }
        self
    }

    pub fn with_bet(self, document_id: impl Into<String>, bet: BetSnapshot) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.bets.entry(document_id.into()).or_default().push(bet);
        }
        self
    }

    pub fn with_comment(self, document_id: impl Into<String>, comment: CommentSnapshot) -> Self {
        if let Ok(mut state) = self.state.write() {
            state
                .comments
                .entry(document_id.into())
                .or_default()
                .push(comment);
        }
        self
    }

    /// Every history read for this user fails with a transient error
    pub fn with_failing_history(self, user_id: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.failing_histories.insert(user_id.into());
        }
        self
    }

    /// The next `count` commits fail with a transient error
    pub fn with_commit_failures(self, count: usize) -> Self {
        if let Ok(mut state) = self.state.write() {
            state.commit_failures = count;
        }
        self
    }

    /// Sizes of the successful commits, in commit order
    pub fn commit_sizes(&self) -> Vec<usize> {
        self.read().map(|state| state.commits.clone()).unwrap_or_default()
    }

    /// Raw persisted fields of one record
    pub fn record(&self, target: &RecordRef) -> Option<Map<String, Value>> {
        self.read()
            .ok()
            .and_then(|state| state.records.get(target).cloned())
    }

    pub fn record_count(&self, collection: &str) -> usize {
        self.read()
            .map(|state| {
                state
                    .records
                    .keys()
                    .filter(|key| key.collection == collection)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of `recent_engagement` calls served so far
    pub fn engagement_lookups(&self) -> usize {
        self.engagement_lookups.load(Ordering::SeqCst)
    }

    /// Number of `interaction_history` calls served so far, failed ones included
    pub fn history_reads(&self) -> usize {
        self.history_reads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FeedRepository for InMemoryRepository {
    /// Unresolved documents in id order
    ///
    /// Close times are left to the ranker, which checks them against the run's
    /// own clock rather than the wall clock.
    fn candidate_documents(&self) -> BoxStream<'_, AppResult<Document>> {
        let documents: Vec<AppResult<Document>> = match self.read() {
            Ok(state) => state
                .documents
                .values()
                .filter(|doc| !doc.is_resolved && doc.resolution_time.is_none())
                .cloned()
                .map(Ok)
                .collect(),
            Err(e) => vec![Err(e)],
        };
        stream::iter(documents).boxed()
    }

    async fn documents_by_ids(&self, ids: &[String]) -> AppResult<Vec<Document>> {
        let state = self.read()?;
        let mut documents: Vec<Document> = ids
            .iter()
            .filter_map(|id| state.documents.get(id).cloned())
            .collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        documents.dedup_by(|a, b| a.id == b.id);
        Ok(documents)
    }

    async fn users(&self, filter: &UserFilter) -> AppResult<Vec<User>> {
        let state = self.read()?;
        let mut users: Vec<User> = state
            .users
            .iter()
            .filter(|user| match filter {
                UserFilter::All => true,
                UserFilter::Segment(segment) => user.segment.as_deref() == Some(segment.as_str()),
                UserFilter::Ids(ids) => ids.contains(&user.id),
            })
            .cloned()
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }

    async fn interaction_history(&self, user_id: &str) -> AppResult<InteractionHistory> {
        self.history_reads.fetch_add(1, Ordering::SeqCst);
        let state = self.read()?;
        if state.failing_histories.contains(user_id) {
            return Err(AppError::TransientIo(format!(
                "history unavailable for {}",
                user_id
            )));
        }
        Ok(state.histories.get(user_id).cloned().unwrap_or_default())
    }

    async fn recent_engagement(
        &self,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<RecentEngagement> {
        self.engagement_lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.read()?;

        let bet_cutoff = now - Duration::days(RECENT_BET_WINDOW_DAYS);
        let recent_bet = state
            .bets
            .get(document_id)
            .into_iter()
            .flatten()
            .filter(|bet| bet.created_time > bet_cutoff)
            .max_by_key(|bet| bet.created_time)
            .cloned();

        let comment_cutoff = now - Duration::days(RECENT_COMMENT_WINDOW_DAYS);
        let mut recent_comments: Vec<CommentSnapshot> = state
            .comments
            .get(document_id)
            .into_iter()
            .flatten()
            .filter(|comment| comment.created_time > comment_cutoff)
            .cloned()
            .collect();
        recent_comments.sort_by(|a, b| {
            b.created_time
                .cmp(&a.created_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        recent_comments.truncate(RECENT_COMMENT_LIMIT);

        Ok(RecentEngagement {
            recent_bet,
            recent_comments,
        })
    }

    async fn user_feed(&self, key: &FeedKey) -> AppResult<Option<Vec<FeedEntry>>> {
        let target = RecordRef::new(USER_FEEDS_COLLECTION, key.to_string());
        let state = self.read()?;
        state.records.get(&target).map(feed_entries).transpose()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait::async_trait]
impl BatchCommitter for InMemoryRepository {
    async fn commit(&self, chunk: &[BatchUpdateSpec], mode: WriteMode) -> AppResult<()> {
        if chunk.len() > MAX_BATCH_SIZE {
            return Err(AppError::BatchTooLarge {
                size: chunk.len(),
                limit: MAX_BATCH_SIZE,
            });
        }

        let mut state = self.write()?;
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(AppError::TransientIo("commit rejected".to_string()));
        }

        for spec in chunk {
            match mode {
                WriteMode::Overwrite => {
                    state.records.insert(spec.target.clone(), spec.fields.clone());
                }
                WriteMode::UpdateExisting => {
                    if let Some(existing) = state.records.get_mut(&spec.target) {
                        existing.extend(spec.fields.clone());
                    }
                }
            }
        }
        state.commits.push(chunk.len());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    use crate::models::OutcomeKind;

    fn document(id: &str) -> Document {
        Document {
            id: id.to_string(),
            question: Some(format!("Question {}", id)),
            description: None,
            tags: Vec::new(),
            creator_username: None,
            created_time: Utc::now(),
            close_time: None,
            resolution_time: None,
            last_bet_time: None,
            last_comment_time: None,
            volume_24h: 0.0,
            volume_7d: 0.0,
            probability: Some(0.5),
            outcome_probabilities: Vec::new(),
            outcome_kind: OutcomeKind::Binary,
            is_resolved: false,
        }
    }

    fn spec(id: &str, value: i64) -> BatchUpdateSpec {
        let mut fields = Map::new();
        fields.insert("value".to_string(), json!(value));
        BatchUpdateSpec {
            target: RecordRef::new("things", id),
            fields,
        }
    }

    #[tokio::test]
    async fn test_candidates_skip_resolved_documents() {
        let mut resolved = document("b");
        resolved.is_resolved = true;
        let repo =
            InMemoryRepository::new().with_documents(vec![document("c"), resolved, document("a")]);

        let ids: Vec<String> = repo
            .candidate_documents()
            .map_ok(|doc| doc.id)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_users_filter_by_segment_and_ids() {
        let repo = InMemoryRepository::new().with_users(vec![
            User {
                id: "u2".to_string(),
                username: "two".to_string(),
                segment: Some("pro".to_string()),
            },
            User {
                id: "u1".to_string(),
                username: "one".to_string(),
                segment: None,
            },
        ]);

        let pros = repo.users(&UserFilter::Segment("pro".to_string())).await.unwrap();
        assert_eq!(pros.len(), 1);
        assert_eq!(pros[0].id, "u2");

        let picked = repo.users(&UserFilter::Ids(vec!["u1".to_string()])).await.unwrap();
        assert_eq!(picked[0].id, "u1");

        let all = repo.users(&UserFilter::All).await.unwrap();
        assert_eq!(all.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(), vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_recent_engagement_applies_windows() {
        let now = Utc::now();
        let comment = |id: &str, hours: i64| CommentSnapshot {
            id: id.to_string(),
            user_id: "u9".to_string(),
            text: "hm".to_string(),
            created_time: now - Duration::hours(hours),
        };
        let repo = InMemoryRepository::new()
            .with_bet("m1", BetSnapshot {
                user_id: "u1".to_string(),
                amount: 10.0,
                outcome: "YES".to_string(),
                created_time: now - Duration::hours(30),
            })
            .with_comment("m1", comment("c1", 1))
            .with_comment("m1", comment("c2", 2))
            .with_comment("m1", comment("c3", 3))
            .with_comment("m1", comment("c4", 4))
            .with_comment("m1", comment("c5", 100));

        let engagement = repo.recent_engagement("m1", now).await.unwrap();
        assert!(engagement.recent_bet.is_none());
        let ids: Vec<&str> = engagement.recent_comments.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert_eq!(repo.engagement_lookups(), 1);
    }

    #[tokio::test]
    async fn test_update_existing_skips_missing_records() {
        let repo = InMemoryRepository::new();
        repo.commit(&[spec("x", 1)], WriteMode::UpdateExisting).await.unwrap();
        assert!(repo.record(&RecordRef::new("things", "x")).is_none());

        repo.commit(&[spec("x", 1)], WriteMode::Overwrite).await.unwrap();
        repo.commit(&[spec("x", 2)], WriteMode::UpdateExisting).await.unwrap();
        let fields = repo.record(&RecordRef::new("things", "x")).unwrap();
        assert_eq!(fields["value"], json!(2));
        assert_eq!(repo.commit_sizes(), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let repo = InMemoryRepository::new()
            .with_failing_history("u1")
            .with_commit_failures(1);

        let history = repo.interaction_history("u1").await;
        assert!(matches!(history, Err(AppError::TransientIo(_))));
        assert_eq!(
            repo.interaction_history("u2").await.unwrap(),
            InteractionHistory::default()
        );

        assert!(repo.commit(&[spec("x", 1)], WriteMode::Overwrite).await.is_err());
        assert!(repo.commit(&[spec("x", 1)], WriteMode::Overwrite).await.is_ok());
        assert_eq!(repo.commit_sizes(), vec![1]);
    }
}
