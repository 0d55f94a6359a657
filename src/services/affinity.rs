use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{Document, RelevanceWeights, WordFrequencyProfile};

/// Smoothing term keeping weights below 1 and defined for unseen tokens
pub const RELEVANCE_EPSILON: f64 = 1e-4;

/// Residue below which a subtracted mass is treated as zero
const MASS_TOLERANCE: f64 = 1e-12;

/// Splits text into lower-cased runs of ASCII letters
///
/// Digits and punctuation act as separators and never become tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphabetic() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Text a document contributes to its profile
pub fn document_text(document: &Document) -> String {
    [
        document.creator_username.as_deref().unwrap_or_default(),
        document.question.as_deref().unwrap_or_default(),
        document.tags.join(" ").as_str(),
        document.description.as_deref().unwrap_or_default(),
    ]
    .join(" ")
}

/// Normalized token frequencies of a single document
pub fn document_profile(document: &Document) -> WordFrequencyProfile {
    let mut counts: BTreeMap<String, f64> = BTreeMap::new();
    for token in tokenize(&document_text(document)) {
        *counts.entry(token).or_insert(0.0) += 1.0;
    }
    WordFrequencyProfile::from_masses(counts)
}

/// Running token-wise sum of unit-mass document profiles
///
/// Each document adds exactly one unit of mass, so long descriptions cannot
/// outweigh short ones once the sum is normalized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileAccumulator {
    masses: BTreeMap<String, f64>,
    documents: usize,
}

impl ProfileAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, profile: &WordFrequencyProfile) {
        if profile.is_empty() {
            return;
        }
        for (token, frequency) in profile.iter() {
            *self.masses.entry(token.to_string()).or_insert(0.0) += frequency;
        }
        self.documents += 1;
    }

    pub fn merge(&mut self, other: &ProfileAccumulator) {
        for (token, mass) in &other.masses {
            *self.masses.entry(token.clone()).or_insert(0.0) += mass;
        }
        self.documents += other.documents;
    }

    /// Removes another accumulator's contribution, e.g. one user's from the population
    pub fn without(&self, other: &ProfileAccumulator) -> ProfileAccumulator {
        let mut masses = self.masses.clone();
        for (token, mass) in &other.masses {
            if let Some(existing) = masses.get_mut(token) {
                *existing -= mass;
            }
        }
        masses.retain(|_, mass| *mass > MASS_TOLERANCE);

        ProfileAccumulator {
            masses,
            documents: self.documents.saturating_sub(other.documents),
        }
    }

    pub fn documents(&self) -> usize {
        self.documents
    }

    pub fn to_profile(&self) -> WordFrequencyProfile {
        WordFrequencyProfile::from_masses(self.masses.clone())
    }
}

/// Aggregate frequency over many documents, each normalized before summing
pub fn aggregate_profile<'a>(
    profiles: impl IntoIterator<Item = &'a WordFrequencyProfile>,
) -> WordFrequencyProfile {
    let mut accumulator = ProfileAccumulator::new();
    for profile in profiles {
        accumulator.add(profile);
    }
    accumulator.to_profile()
}

/// Weight per token: `yours / (yours + others + ε)` over the union of both vocabularies
pub fn relevance_weights(
    yours: &WordFrequencyProfile,
    others: &WordFrequencyProfile,
) -> RelevanceWeights {
    let weights = yours
        .tokens()
        .chain(others.tokens())
        .map(|token| {
            let your_freq = yours.get(token);
            let other_freq = others.get(token);
            let weight = your_freq / (your_freq + other_freq + RELEVANCE_EPSILON);
            (token.to_string(), weight)
        })
        .collect();

    RelevanceWeights::new(weights)
}

/// Relevance of a document: its own token frequencies weighted by the user's weights
pub fn score_profile(profile: &WordFrequencyProfile, weights: &RelevanceWeights) -> f64 {
    profile
        .iter()
        .map(|(token, frequency)| frequency * weights.get(token))
        .sum()
}
