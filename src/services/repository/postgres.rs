//! PostgreSQL backend for documents, interaction logs and persisted feeds
//!
//! Feeds and other pipeline output live in a generic `records` table keyed by
//! (collection, id) with a JSONB field map, so one batch commit can cover any
//! mix of record kinds.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use sqlx::{types::Json, FromRow, PgPool};
use std::collections::{HashMap, HashSet};

use crate::{
    error::{AppError, AppResult},
    models::{
        BetSnapshot, ClickEvent, CommentSnapshot, Document, FeedEntry, FeedKey,
        InteractionHistory, OutcomeKind, RecentEngagement, User, UserFilter,
    },
    services::{
        batch_writer::{BatchCommitter, BatchUpdateSpec, WriteMode, MAX_BATCH_SIZE},
        repository::{
            feed_entries, FeedRepository, RECENT_BET_WINDOW_DAYS, RECENT_COMMENT_LIMIT,
            RECENT_COMMENT_WINDOW_DAYS, USER_FEEDS_COLLECTION,
        },
    },
};

/// Rows fetched per page of the candidate stream
const DOCUMENT_PAGE_SIZE: i64 = 500;

const DOCUMENT_COLUMNS: &str = r#"
    id, question, description, tags, creator_username, created_time, close_time,
    resolution_time, last_bet_time, last_comment_time, volume_24h, volume_7d,
    probability, outcome_probabilities, outcome_type, is_resolved
"#;

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: String,
    question: Option<String>,
    description: Option<String>,
    tags: Option<Vec<String>>,
    creator_username: Option<String>,
    created_time: DateTime<Utc>,
    close_time: Option<DateTime<Utc>>,
    resolution_time: Option<DateTime<Utc>>,
    last_bet_time: Option<DateTime<Utc>>,
    last_comment_time: Option<DateTime<Utc>>,
    volume_24h: Option<f64>,
    volume_7d: Option<f64>,
    probability: Option<f64>,
    outcome_probabilities: Option<Vec<f64>>,
    outcome_type: Option<String>,
    is_resolved: Option<bool>,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        // Missing text degrades to an empty-token document rather than failing the feed
        if row.question.is_none() {
            tracing::warn!(document_id = %row.id, "Document has no question text");
        }

        Document {
            id: row.id,
            question: row.question,
            description: row.description,
            tags: row.tags.unwrap_or_default(),
            creator_username: row.creator_username,
            created_time: row.created_time,
            close_time: row.close_time,
            resolution_time: row.resolution_time,
            last_bet_time: row.last_bet_time,
            last_comment_time: row.last_comment_time,
            volume_24h: row.volume_24h.unwrap_or(0.0),
            volume_7d: row.volume_7d.unwrap_or(0.0),
            probability: row.probability,
            outcome_probabilities: row.outcome_probabilities.unwrap_or_default(),
            outcome_kind: row
                .outcome_type
                .as_deref()
                .map(OutcomeKind::parse)
                .unwrap_or(OutcomeKind::Other),
            is_resolved: row.is_resolved.unwrap_or(false),
        }
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    username: String,
    segment: Option<String>,
}

#[derive(Clone)]
pub struct PgFeedRepository {
    pool: PgPool,
}

impl PgFeedRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Close time is left to the ranker so every run filters against its own clock
    fn document_page_sql() -> String {
        format!(
            r#"
            SELECT {DOCUMENT_COLUMNS}
            FROM documents
            WHERE id > $1
              AND NOT coalesce(is_resolved, false)
              AND resolution_time IS NULL
            ORDER BY id
            LIMIT $2
            "#
        )
    }

    async fn fetch_document_page(pool: &PgPool, after: &str) -> AppResult<Vec<DocumentRow>> {
        let sql = Self::document_page_sql();
        let rows = sqlx::query_as::<_, DocumentRow>(&sql)
            .bind(after)
            .bind(DOCUMENT_PAGE_SIZE)
            .fetch_all(pool)
            .await?;

        Ok(rows)
    }
}

#[async_trait::async_trait]
impl FeedRepository for PgFeedRepository {
    fn candidate_documents(&self) -> BoxStream<'_, AppResult<Document>> {
        // Keyset pagination: the cursor is the last id seen, `None` once exhausted
        stream::try_unfold(Some(String::new()), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok::<_, AppError>(None);
            };

            let rows = Self::fetch_document_page(&self.pool, &after).await?;
            if rows.is_empty() {
                return Ok(None);
            }

            let next = if (rows.len() as i64) < DOCUMENT_PAGE_SIZE {
                None
            } else {
                rows.last().map(|row| row.id.clone())
            };

            tracing::debug!(page_size = rows.len(), after = %after, "Fetched document page");

            let page: Vec<AppResult<Document>> =
                rows.into_iter().map(|row| Ok(Document::from(row))).collect();
            Ok(Some((stream::iter(page), next)))
        })
        .try_flatten()
        .boxed()
    }

    async fn documents_by_ids(&self, ids: &[String]) -> AppResult<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql =
            format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ANY($1) ORDER BY id");
        let rows = sqlx::query_as::<_, DocumentRow>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Document::from).collect())
    }

    async fn users(&self, filter: &UserFilter) -> AppResult<Vec<User>> {
        let rows = match filter {
            UserFilter::All => {
                sqlx::query_as::<_, UserRow>("SELECT id, username, segment FROM users ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
            UserFilter::Segment(segment) => {
                sqlx::query_as::<_, UserRow>(
                    "SELECT id, username, segment FROM users WHERE segment = $1 ORDER BY id",
                )
                .bind(segment)
                .fetch_all(&self.pool)
                .await?
            }
            UserFilter::Ids(ids) => {
                sqlx::query_as::<_, UserRow>(
                    "SELECT id, username, segment FROM users WHERE id = ANY($1) ORDER BY id",
                )
                .bind(ids)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|row| User {
                id: row.id,
                username: row.username,
                segment: row.segment,
            })
            .collect())
    }

    async fn interaction_history(&self, user_id: &str) -> AppResult<InteractionHistory> {
        let bet_document_ids: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT document_id FROM user_bets WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        let views: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT document_id, last_viewed_time
            FROM user_views
            WHERE user_id = $1 AND last_viewed_time IS NOT NULL
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let clicks: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT document_id, clicked_time
            FROM user_clicks
            WHERE user_id = $1
            ORDER BY clicked_time, document_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(InteractionHistory {
            bet_document_ids: bet_document_ids
                .into_iter()
                .map(|(id,)| id)
                .collect::<HashSet<_>>(),
            last_viewed: views.into_iter().collect::<HashMap<_, _>>(),
            clicks: clicks
                .into_iter()
                .map(|(document_id, clicked_time)| ClickEvent {
                    document_id,
                    clicked_time,
                })
                .collect(),
        })
    }

    async fn recent_engagement(
        &self,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<RecentEngagement> {
        let recent_bet: Option<(String, f64, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT user_id, amount, outcome, created_time
            FROM user_bets
            WHERE document_id = $1 AND created_time > $2
            ORDER BY created_time DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(document_id)
        .bind(now - Duration::days(RECENT_BET_WINDOW_DAYS))
        .fetch_optional(&self.pool)
        .await?;

        let comments: Vec<(String, String, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, user_id, content, created_time
            FROM document_comments
            WHERE document_id = $1 AND created_time > $2
            ORDER BY created_time DESC, id
            LIMIT $3
            "#,
        )
        .bind(document_id)
        .bind(now - Duration::days(RECENT_COMMENT_WINDOW_DAYS))
        .bind(RECENT_COMMENT_LIMIT as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(RecentEngagement {
            recent_bet: recent_bet.map(|(user_id, amount, outcome, created_time)| BetSnapshot {
                user_id,
                amount,
                outcome,
                created_time,
            }),
            recent_comments: comments
                .into_iter()
                .map(|(id, user_id, text, created_time)| CommentSnapshot {
                    id,
                    user_id,
                    text,
                    created_time,
                })
                .collect(),
        })
    }

    async fn user_feed(&self, key: &FeedKey) -> AppResult<Option<Vec<FeedEntry>>> {
        let record: Option<(Json<Map<String, Value>>,)> =
            sqlx::query_as("SELECT fields FROM records WHERE collection = $1 AND id = $2")
                .bind(USER_FEEDS_COLLECTION)
                .bind(key.to_string())
                .fetch_optional(&self.pool)
                .await?;

        record.map(|(Json(fields),)| feed_entries(&fields)).transpose()
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait::async_trait]
impl BatchCommitter for PgFeedRepository {
    async fn commit(&self, chunk: &[BatchUpdateSpec], mode: WriteMode) -> AppResult<()> {
        if chunk.len() > MAX_BATCH_SIZE {
            return Err(AppError::BatchTooLarge {
                size: chunk.len(),
                limit: MAX_BATCH_SIZE,
            });
        }

        let sql = match mode {
            WriteMode::Overwrite => {
                r#"
                INSERT INTO records (collection, id, fields, updated_at)
                VALUES ($1, $2, $3, now())
                ON CONFLICT (collection, id)
                DO UPDATE SET fields = EXCLUDED.fields, updated_at = now()
                "#
            }
            WriteMode::UpdateExisting => {
                r#"
                UPDATE records
                SET fields = fields || $3, updated_at = now()
                WHERE collection = $1 AND id = $2
                "#
            }
        };

        let mut tx = self.pool.begin().await?;
        for spec in chunk {
            sqlx::query(sql)
                .bind(&spec.target.collection)
                .bind(&spec.target.id)
                .bind(Json(&spec.fields))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }
}
