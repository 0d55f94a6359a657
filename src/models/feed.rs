use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Most recent bet on a document within the engagement window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BetSnapshot {
    pub user_id: String,
    pub amount: f64,
    pub outcome: String,
    pub created_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommentSnapshot {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub created_time: DateTime<Utc>,
}

/// Recent activity shown next to a feed item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RecentEngagement {
    /// Latest bet placed within the last day
    pub recent_bet: Option<BetSnapshot>,
    /// Up to three newest comments from the last three days, newest first
    pub recent_comments: Vec<CommentSnapshot>,
}

/// One ranked item of a persisted feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedEntry {
    pub document_id: String,
    pub question: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engagement: Option<RecentEngagement>,
}

/// Identity of a persisted feed: a user's main feed or one of their category feeds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedKey {
    pub user_id: String,
    pub category: Option<String>,
}

impl FeedKey {
    pub fn main(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            category: None,
        }
    }

    pub fn category(user_id: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            category: Some(category.into()),
        }
    }
}

/// Percent-escapes `%` and the `:` separator so distinct keys never share a record id
fn escape_component(component: &str) -> String {
    component.replace('%', "%25").replace(':', "%3A")
}

impl Display for FeedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let user_id = escape_component(&self.user_id);
        match &self.category {
            Some(category) => write!(
                f,
                "{}:{}",
                user_id,
                escape_component(&category.to_lowercase())
            ),
            None => write!(f, "{}", user_id),
        }
    }
}
