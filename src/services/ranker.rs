use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    error::AppResult,
    models::{
        Document, FeedEntry, InteractionHistory, RecentEngagement, RelevanceWeights,
        WordFrequencyProfile,
    },
    services::{activity::activity_score, affinity::{document_profile, score_profile}},
};

/// A candidate document with its token profile computed once per run
#[derive(Debug, Clone)]
pub struct CandidateDocument {
    pub document: Document,
    pub profile: WordFrequencyProfile,
}

impl CandidateDocument {
    pub fn new(document: Document) -> Self {
        let profile = document_profile(&document);
        Self { document, profile }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RankedDocument<'a> {
    pub document: &'a Document,
    pub affinity: f64,
    pub activity: f64,
    pub score: f64,
}

/// Orders candidate documents for one viewer
#[derive(Debug, Clone, Copy)]
pub struct FeedRanker {
    feed_size: usize,
    exclude_bet_documents: bool,
}

impl FeedRanker {
    pub fn new(feed_size: usize, exclude_bet_documents: bool) -> Self {
        Self {
            feed_size,
            exclude_bet_documents,
        }
    }

    /// Scores eligible candidates and keeps the top `feed_size`
    ///
    /// The score is affinity times activity. Sorting is stable, so equal
    /// scores keep candidate order. `category` limits candidates to documents
    /// carrying that tag.
    pub fn rank<'a>(
        &self,
        candidates: &'a [CandidateDocument],
        weights: &RelevanceWeights,
        history: &InteractionHistory,
        category: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<RankedDocument<'a>> {
        let mut ranked: Vec<RankedDocument<'a>> = candidates
            .iter()
            .filter(|candidate| self.is_eligible(&candidate.document, history, category, now))
            .map(|candidate| {
                let document = &candidate.document;
                let affinity = score_profile(&candidate.profile, weights);
                let activity =
                    activity_score(document, history.last_viewed.get(&document.id).copied(), now);
                RankedDocument {
                    document,
                    affinity,
                    activity,
                    score: affinity * activity,
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(self.feed_size);
        ranked
    }

    fn is_eligible(
        &self,
        document: &Document,
        history: &InteractionHistory,
        category: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        if !document.is_open(now) {
            return false;
        }
        if self.exclude_bet_documents && history.bet_document_ids.contains(&document.id) {
            return false;
        }
        category.map_or(true, |category| document.has_tag(category))
    }
}

/// Turns ranked documents into feed entries, optionally with engagement snapshots
///
/// Lookups run one after another in feed order.
pub async fn build_entries<F, Fut>(
    ranked: &[RankedDocument<'_>],
    mut engagement: Option<F>,
) -> AppResult<Vec<FeedEntry>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = AppResult<RecentEngagement>>,
{
    let mut entries = Vec::with_capacity(ranked.len());

    for item in ranked {
        let snapshot = match engagement.as_mut() {
            Some(lookup) => Some(lookup(item.document.id.clone()).await?),
            None => None,
        };

        entries.push(FeedEntry {
            document_id: item.document.id.clone(),
            question: item.document.question.clone().unwrap_or_default(),
            score: item.score,
            engagement: snapshot,
        });
    }

    Ok(entries)
}

/// Engagement snapshots shared by every user of one chunk
///
/// Popular documents show up in most feeds; each one is fetched at most once
/// per chunk unless two users race on it.
#[derive(Default)]
pub struct EngagementMemo {
    snapshots: RwLock<HashMap<String, RecentEngagement>>,
}

impl EngagementMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_fetch<Fut>(
        &self,
        document_id: &str,
        fetch: Fut,
    ) -> AppResult<RecentEngagement>
    where
        Fut: Future<Output = AppResult<RecentEngagement>>,
    {
        if let Some(snapshot) = self.snapshots.read().await.get(document_id) {
            return Ok(snapshot.clone());
        }

        let snapshot = fetch.await?;
        self.snapshots
            .write()
            .await
            .insert(document_id.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutcomeKind;
    use crate::services::affinity::{aggregate_profile, relevance_weights};
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn document(id: &str, question: &str, tags: &[&str], created: DateTime<Utc>) -> Document {
        Document {
            id: id.to_string(),
            question: Some(question.to_string()),
            description: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            creator_username: None,
            created_time: created,
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

    fn uniform_weights(candidates: &[CandidateDocument]) -> RelevanceWeights {
        RelevanceWeights::new(
            candidates
                .iter()
                .flat_map(|c| c.profile.tokens().map(|t| (t.to_string(), 0.5)))
                .collect(),
        )
    }

    #[test]
    fn test_election_bettor_prefers_fresh_election_market() {
        let history_docs = [
            document(
                "h1",
                "Who will win the presidential election?",
                &["Politics"],
                now() - Duration::days(30),
            ),
            document(
                "h2",
                "Election turnout above sixty percent?",
                &["Politics"],
                now() - Duration::days(20),
            ),
        ];
        let others_docs = [
            document(
                "o1",
                "Best cooking show of the year?",
                &["Food"],
                now() - Duration::days(40),
            ),
            document(
                "o2",
                "Will the recipe book sell out?",
                &["Cooking"],
                now() - Duration::days(40),
            ),
        ];
        let history_profiles: Vec<_> = history_docs.iter().map(document_profile).collect();
        let others_profiles: Vec<_> = others_docs.iter().map(document_profile).collect();
        let yours = aggregate_profile(&history_profiles);
        let others = aggregate_profile(&others_profiles);
        let weights = relevance_weights(&yours, &others);

        let mut cooking = document(
            "c1",
            "Which cooking recipe wins the contest?",
            &["Cooking"],
            now() - Duration::days(7),
        );
        cooking.volume_24h = 1.0;
        let election = document(
            "e1",
            "Election polling lead in September?",
            &["Politics"],
            now() - Duration::minutes(5),
        );
        let candidates = vec![CandidateDocument::new(cooking), CandidateDocument::new(election)];

        let ranked = FeedRanker::new(48, true).rank(
            &candidates,
            &weights,
            &InteractionHistory::default(),
            None,
            now(),
        );

        assert_eq!(ranked[0].document.id, "e1");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_ties_keep_candidate_order_and_truncate() {
        let candidates: Vec<CandidateDocument> = (0..5)
            .map(|i| {
                let created = now() - Duration::days(10);
                CandidateDocument::new(document(&format!("d{}", i), "same words", &[], created))
            })
            .collect();
        let weights = uniform_weights(&candidates);
        let history = InteractionHistory::default();

        let ranked = FeedRanker::new(3, true).rank(&candidates, &weights, &history, None, now());
        let ids: Vec<&str> = ranked.iter().map(|r| r.document.id.as_str()).collect();
        assert_eq!(ids, vec!["d0", "d1", "d2"]);
    }

    #[test]
    fn test_closed_and_bet_documents_are_skipped() {
        let mut closed = document("closed", "alpha", &[], now() - Duration::days(2));
        closed.close_time = Some(now() - Duration::hours(1));
        let bet = document("bet", "alpha", &[], now() - Duration::days(2));
        let open = document("open", "alpha", &[], now() - Duration::days(2));
        let candidates = vec![
            CandidateDocument::new(closed),
            CandidateDocument::new(bet),
            CandidateDocument::new(open),
        ];
        let weights = uniform_weights(&candidates);
        let mut history = InteractionHistory::default();
        history.bet_document_ids.insert("bet".to_string());

        let ranked = FeedRanker::new(48, true).rank(&candidates, &weights, &history, None, now());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].document.id, "open");

        let ranked = FeedRanker::new(48, false).rank(&candidates, &weights, &history, None, now());
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn test_category_filter_is_case_insensitive() {
        let candidates = vec![
            CandidateDocument::new(document("p", "vote", &["Politics"], now() - Duration::days(2))),
            CandidateDocument::new(document("s", "goal", &["Sports"], now() - Duration::days(2))),
        ];
        let weights = uniform_weights(&candidates);

        let ranked = FeedRanker::new(48, true).rank(
            &candidates,
            &weights,
            &InteractionHistory::default(),
            Some("politics"),
            now(),
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].document.id, "p");
    }

    #[tokio::test]
    async fn test_build_entries_without_engagement() {
        let candidates = vec![CandidateDocument::new(document("d", "alpha beta", &[], now()))];
        let ranked = FeedRanker::new(48, true).rank(
            &candidates,
            &uniform_weights(&candidates),
            &InteractionHistory::default(),
            None,
            now(),
        );

        let no_lookup: Option<fn(String) -> std::future::Ready<AppResult<RecentEngagement>>> = None;
        let entries = build_entries(&ranked, no_lookup).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].question, "alpha beta");
        assert!(entries[0].engagement.is_none());
    }

    #[tokio::test]
    async fn test_memo_fetches_each_document_once() {
        let memo = EngagementMemo::new();
        let fetches = AtomicUsize::new(0);

        for _ in 0..3 {
            memo.get_or_fetch("d1", async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(RecentEngagement::default())
            })
            .await
            .unwrap();
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(memo.len().await, 1);
    }
}
