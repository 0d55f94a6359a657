#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};

use market_feed::{
    models::{ClickEvent, Document, InteractionHistory, OutcomeKind, User},
    services::{
        repository::InMemoryRepository, retry::RetryPolicy, FeedPipeline, PipelineSettings,
    },
};

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn document(id: &str, question: &str, tags: &[&str], age: Duration) -> Document {
    Document {
        id: id.to_string(),
        question: Some(question.to_string()),
        description: None,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        creator_username: None,
        created_time: now() - age,
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

pub fn resolved(mut document: Document) -> Document {
    document.is_resolved = true;
    document.resolution_time = Some(now() - Duration::days(1));
    document
}

pub fn user(id: &str, segment: Option<&str>) -> User {
    User {
        id: id.to_string(),
        username: format!("{}-name", id),
        segment: segment.map(str::to_string),
    }
}

pub fn bets(document_ids: &[&str]) -> InteractionHistory {
    InteractionHistory {
        bet_document_ids: document_ids.iter().map(|id| id.to_string()).collect(),
        ..InteractionHistory::default()
    }
}

pub fn clicks(document_ids: &[&str]) -> InteractionHistory {
    InteractionHistory {
        clicks: document_ids
            .iter()
            .map(|id| ClickEvent {
                document_id: id.to_string(),
                clicked_time: now() - Duration::days(2),
            })
            .collect(),
        ..InteractionHistory::default()
    }
}

pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        retry: RetryPolicy::new(3, StdDuration::from_millis(1)),
        ..PipelineSettings::default()
    }
}

/// An election bettor, a cooking fan, and one fresh market of each kind
pub fn election_world() -> InMemoryRepository {
    InMemoryRepository::new()
        .with_documents(vec![
            resolved(document(
                "h1",
                "Who will win the presidential election?",
                &["Politics"],
                Duration::days(60),
            )),
            resolved(document(
                "h2",
                "Election turnout above sixty percent?",
                &["Politics"],
                Duration::days(50),
            )),
            resolved(document(
                "o1",
                "Best cooking show of the year?",
                &["Food"],
                Duration::days(60),
            )),
            resolved(document(
                "o2",
                "Will the recipe book sell out?",
                &["Cooking"],
                Duration::days(60),
            )),
            document(
                "c1",
                "Which cooking recipe wins the contest?",
                &["Cooking"],
                Duration::days(7),
            ),
            document(
                "e1",
                "Election polling lead in September?",
                &["Politics"],
                Duration::minutes(5),
            ),
        ])
        .with_users(vec![user("alice", Some("politics")), user("bob", None)])
        .with_history("alice", bets(&["h1", "h2"]))
        .with_history("bob", clicks(&["o1", "o2"]))
}

pub fn pipeline(repo: &Arc<InMemoryRepository>, settings: PipelineSettings) -> FeedPipeline {
    FeedPipeline::new(repo.clone(), repo.clone(), settings)
}
