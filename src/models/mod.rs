use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
};

pub mod feed;
pub mod profile;

pub use feed::{BetSnapshot, CommentSnapshot, FeedEntry, FeedKey, RecentEngagement};
pub use profile::{RelevanceWeights, WordFrequencyProfile};

/// How a market resolves, which decides where its probability signal lives
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Binary,
    MultipleChoice,
    Other,
}

impl OutcomeKind {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "binary" => OutcomeKind::Binary,
            "multiple_choice" | "multiple-choice" | "multi" => OutcomeKind::MultipleChoice,
            _ => OutcomeKind::Other,
        }
    }
}

/// A market that can appear in a user's feed
///
/// Text fields are optional: rows with missing text still rank, they simply
/// contribute no tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub creator_username: Option<String>,
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_bet_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_comment_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub volume_24h: f64,
    #[serde(default)]
    pub volume_7d: f64,
    /// Current probability of a binary market
    #[serde(default)]
    pub probability: Option<f64>,
    /// Per-outcome probabilities of a multiple-choice market
    #[serde(default)]
    pub outcome_probabilities: Vec<f64>,
    pub outcome_kind: OutcomeKind,
    #[serde(default)]
    pub is_resolved: bool,
}

impl Document {
    /// Whether the market can still be traded at `now`
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        !self.is_resolved
            && self.resolution_time.is_none()
            && self.close_time.map_or(true, |close| close > now)
    }

    /// Case-insensitive tag membership
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Probability signal used for the uncertainty heuristic, if any
    ///
    /// Multiple-choice markets report their leading outcome floored at 0.5.
    pub fn probability_signal(&self) -> Option<f64> {
        match self.outcome_kind {
            OutcomeKind::Binary => self.probability,
            OutcomeKind::MultipleChoice => self
                .outcome_probabilities
                .iter()
                .copied()
                .reduce(f64::max)
                .or(self.probability)
                .map(|p| p.max(0.5)),
            OutcomeKind::Other => self.probability,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub segment: Option<String>,
}

/// Which users a run covers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum UserFilter {
    #[default]
    All,
    Segment(String),
    Ids(Vec<String>),
}

impl Display for UserFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserFilter::All => write!(f, "all"),
            UserFilter::Segment(segment) => write!(f, "segment:{}", segment),
            UserFilter::Ids(ids) => write!(f, "ids:{}", ids.len()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClickEvent {
    pub document_id: String,
    pub clicked_time: DateTime<Utc>,
}

/// Everything a user has done with documents, as read from the append-only logs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InteractionHistory {
    pub bet_document_ids: HashSet<String>,
    pub last_viewed: HashMap<String, DateTime<Utc>>,
    pub clicks: Vec<ClickEvent>,
}

impl InteractionHistory {
    /// Documents that define the user's taste: anything bet on or clicked
    ///
    /// Sorted so profile aggregation sees documents in a fixed order.
    pub fn engaged_document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .bet_document_ids
            .iter()
            .cloned()
            .chain(self.clicks.iter().map(|c| c.document_id.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn document(kind: OutcomeKind) -> Document {
        Document {
            id: "m1".to_string(),
            question: Some("Will it rain?".to_string()),
            description: None,
            tags: vec!["Weather".to_string()],
            creator_username: None,
            created_time: Utc::now(),
            close_time: None,
            resolution_time: None,
            last_bet_time: None,
            last_comment_time: None,
            volume_24h: 0.0,
            volume_7d: 0.0,
            probability: None,
            outcome_probabilities: Vec::new(),
            outcome_kind: kind,
            is_resolved: false,
        }
    }

    #[test]
    fn test_outcome_kind_parse() {
        assert_eq!(OutcomeKind::parse("BINARY"), OutcomeKind::Binary);
        assert_eq!(OutcomeKind::parse("multiple_choice"), OutcomeKind::MultipleChoice);
        assert_eq!(OutcomeKind::parse("numeric"), OutcomeKind::Other);
    }

    #[test]
    fn test_multiple_choice_probability_is_floored() {
        let mut doc = document(OutcomeKind::MultipleChoice);
        doc.outcome_probabilities = vec![0.2, 0.3, 0.25];
        assert_eq!(doc.probability_signal(), Some(0.5));

        doc.outcome_probabilities = vec![0.8, 0.2];
        assert_eq!(doc.probability_signal(), Some(0.8));
    }

    #[test]
    fn test_binary_probability_passthrough() {
        let mut doc = document(OutcomeKind::Binary);
        assert_eq!(doc.probability_signal(), None);
        doc.probability = Some(0.1);
        assert_eq!(doc.probability_signal(), Some(0.1));
    }

    #[test]
    fn test_is_open() {
        let now = Utc::now();
        let mut doc = document(OutcomeKind::Binary);
        assert!(doc.is_open(now));

        doc.close_time = Some(now - Duration::hours(1));
        assert!(!doc.is_open(now));

        doc.close_time = Some(now + Duration::hours(1));
        doc.is_resolved = true;
        assert!(!doc.is_open(now));
    }

    #[test]
    fn test_has_tag_ignores_case() {
        let doc = document(OutcomeKind::Binary);
        assert!(doc.has_tag("weather"));
        assert!(!doc.has_tag("sports"));
    }

    #[test]
    fn test_engaged_document_ids_dedupes_and_sorts() {
        let mut history = InteractionHistory::default();
        history.bet_document_ids.insert("b".to_string());
        history.bet_document_ids.insert("a".to_string());
        history.clicks.push(ClickEvent {
            document_id: "b".to_string(),
            clicked_time: Utc::now(),
        });
        history.clicks.push(ClickEvent {
            document_id: "c".to_string(),
            clicked_time: Utc::now(),
        });
        assert_eq!(history.engaged_document_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_user_filter_serde() {
        let filter = UserFilter::Segment("politics".to_string());
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r#"{"type":"segment","value":"politics"}"#);

        let all: UserFilter = serde_json::from_str(r#"{"type":"all"}"#).unwrap();
        assert_eq!(all, UserFilter::All);
    }
}
