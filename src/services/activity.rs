//! Freshness and engagement multiplier for a single document.
//!
//! Five factors are multiplied into a raw score in (0, 1], which is then
//! remapped so that every document keeps at least half of its affinity, and
//! documents younger than a day keep at least 70%.

use chrono::{DateTime, Utc};

use crate::models::Document;

const DAY_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

/// Documents younger than this get the higher score floor
pub const NEW_DOCUMENT_WINDOW_DAYS: f64 = 1.0;

/// Recency curves flatten out after this many days
const RECENCY_HORIZON_DAYS: f64 = 3.0;

/// Bounds of the combined log-volume used by the volume factor
const VOLUME_LOG_MIN: f64 = 4.0;
const VOLUME_LOG_MAX: f64 = 20.0;

/// Logarithmic ramp from 0 at `min` to 1 at `max`
pub fn log_interpolation(min: f64, max: f64, value: f64) -> f64 {
    if value <= min {
        0.0
    } else if value >= max {
        1.0
    } else {
        (value - min + 1.0).ln() / (max - min + 1.0).ln()
    }
}

/// Individual factors behind an activity score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityBreakdown {
    pub new_comment: f64,
    pub comment_recency: f64,
    pub bet_recency: f64,
    pub probability: f64,
    pub volume: f64,
    pub raw: f64,
    pub score: f64,
}

fn days_between(earlier: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    ((now - earlier).num_milliseconds() as f64 / DAY_MS).max(0.0)
}

/// Uncertainty factor: 1.0 at p = 0.5 falling to 0.5 at p = 0 or 1
pub fn probability_factor(probability: f64) -> f64 {
    let p = probability.clamp(0.0, 1.0);
    let frac = 1.0 - (p - 0.5).powi(2) / 0.25;
    0.5 + 0.5 * frac
}

pub fn volume_factor(volume_24h: f64, volume_7d: f64) -> f64 {
    let combined = (volume_24h.max(0.0) + 1.0).ln() + (volume_7d.max(0.0) + 1.0).ln();
    0.5 + 0.5 * log_interpolation(VOLUME_LOG_MIN, VOLUME_LOG_MAX, combined)
}

pub fn activity_breakdown(
    document: &Document,
    last_viewed: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ActivityBreakdown {
    let has_unseen_comment = match (document.last_comment_time, last_viewed) {
        (Some(comment), Some(viewed)) => comment > viewed,
        (Some(_), None) => true,
        (None, _) => false,
    };
    let new_comment = if has_unseen_comment { 1.0 } else { 0.5 };

    let days_since_comment = days_between(
        document.last_comment_time.unwrap_or(document.created_time),
        now,
    );
    let comment_recency =
        0.25 + 0.75 * (1.0 - log_interpolation(0.0, RECENCY_HORIZON_DAYS, days_since_comment));

    let days_since_bet = days_between(document.last_bet_time.unwrap_or(document.created_time), now);
    let bet_recency =
        0.5 + 0.5 * (1.0 - log_interpolation(0.0, RECENCY_HORIZON_DAYS, days_since_bet));

    // No probability signal reads as maximally uncertain.
    let probability = probability_factor(document.probability_signal().unwrap_or(0.5));

    let volume = volume_factor(document.volume_24h, document.volume_7d);

    let raw = new_comment * comment_recency * bet_recency * probability * volume;

    let age_days = days_between(document.created_time, now);
    let score = if age_days < NEW_DOCUMENT_WINDOW_DAYS {
        0.7 + 0.3 * raw
    } else {
        0.5 + 0.5 * raw
    };

    ActivityBreakdown {
        new_comment,
        comment_recency,
        bet_recency,
        probability,
        volume,
        raw,
        score,
    }
}

/// Activity multiplier for one document as seen by one viewer
pub fn activity_score(
    document: &Document,
    last_viewed: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    activity_breakdown(document, last_viewed, now).score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutcomeKind;
    use chrono::Duration;

    fn document(created: DateTime<Utc>) -> Document {
        Document {
            id: "m1".to_string(),
            question: Some("Will it rain tomorrow?".to_string()),
            description: None,
            tags: Vec::new(),
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

    #[test]
    fn test_log_interpolation_bounds() {
        assert_eq!(log_interpolation(0.0, 3.0, -1.0), 0.0);
        assert_eq!(log_interpolation(0.0, 3.0, 0.0), 0.0);
        assert_eq!(log_interpolation(0.0, 3.0, 3.0), 1.0);
        assert_eq!(log_interpolation(0.0, 3.0, 10.0), 1.0);
        let mid = log_interpolation(0.0, 3.0, 1.0);
        assert!((mid - 2f64.ln() / 4f64.ln()).abs() < 1e-12);
        assert!((mid - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_probability_factor_peaks_at_even_odds() {
        assert_eq!(probability_factor(0.5), 1.0);
        assert_eq!(probability_factor(0.0), 0.5);
        assert_eq!(probability_factor(1.0), 0.5);
        assert!((probability_factor(0.25) - 0.875).abs() < 1e-12);
    }

    #[test]
    fn test_brand_new_document_scores_at_least_floor() {
        let now = Utc::now();
        let mut doc = document(now - Duration::seconds(30));
        doc.probability = Some(0.0);
        let score = activity_score(&doc, None, now);
        assert!(score >= 0.7, "score was {score}");
        assert!(score <= 1.0);
    }

    #[test]
    fn test_old_document_uses_lower_floor() {
        let now = Utc::now();
        let doc = document(now - Duration::days(30));
        let breakdown = activity_breakdown(&doc, None, now);
        assert_eq!(breakdown.new_comment, 0.5);
        assert_eq!(breakdown.comment_recency, 0.25);
        assert_eq!(breakdown.bet_recency, 0.5);
        assert_eq!(breakdown.volume, 0.5);
        let expected_raw = 0.5 * 0.25 * 0.5 * 1.0 * 0.5;
        assert!((breakdown.raw - expected_raw).abs() < 1e-12);
        assert!((breakdown.score - (0.5 + 0.5 * expected_raw)).abs() < 1e-12);
    }

    #[test]
    fn test_unseen_comment_doubles_factor() {
        let now = Utc::now();
        let mut doc = document(now - Duration::days(10));
        doc.last_comment_time = Some(now - Duration::hours(2));

        let before_comment = Some(now - Duration::hours(5));
        let after_comment = Some(now - Duration::hours(1));

        assert_eq!(activity_breakdown(&doc, before_comment, now).new_comment, 1.0);
        assert_eq!(activity_breakdown(&doc, after_comment, now).new_comment, 0.5);
        assert_eq!(activity_breakdown(&doc, None, now).new_comment, 1.0);
    }

    #[test]
    fn test_recency_falls_back_to_creation_time() {
        let now = Utc::now();
        let doc = document(now);
        let breakdown = activity_breakdown(&doc, None, now);
        assert_eq!(breakdown.comment_recency, 1.0);
        assert_eq!(breakdown.bet_recency, 1.0);
    }

    #[test]
    fn test_volume_factor_saturates() {
        assert_eq!(volume_factor(0.0, 0.0), 0.5);
        assert_eq!(volume_factor(1e6, 1e6), 1.0);
        let mid = volume_factor(100.0, 1000.0);
        assert!(mid > 0.5 && mid < 1.0);
    }

    #[test]
    fn test_missing_probability_is_neutral() {
        let now = Utc::now();
        let mut doc = document(now - Duration::days(2));
        doc.outcome_kind = OutcomeKind::Other;
        doc.probability = None;
        assert_eq!(activity_breakdown(&doc, None, now).probability, 1.0);
    }

    #[test]
    fn test_deterministic_for_fixed_now() {
        let now = Utc::now();
        let mut doc = document(now - Duration::hours(40));
        doc.volume_24h = 250.0;
        doc.volume_7d = 4000.0;
        doc.last_bet_time = Some(now - Duration::hours(3));
        let first = activity_score(&doc, None, now);
        let second = activity_score(&doc, None, now);
        assert_eq!(first.to_bits(), second.to_bits());
    }
}
