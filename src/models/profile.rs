use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Token frequencies normalized to unit mass
///
/// An ordered map keeps iteration order, and therefore float summation order,
/// identical across processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct WordFrequencyProfile {
    frequencies: BTreeMap<String, f64>,
}

impl WordFrequencyProfile {
    /// Normalizes raw (non-negative) masses so they sum to 1
    ///
    /// Non-positive entries are dropped; an all-zero input yields an empty profile.
    pub fn from_masses(masses: BTreeMap<String, f64>) -> Self {
        let total: f64 = masses.values().filter(|v| **v > 0.0).sum();
        if total <= 0.0 {
            return Self::default();
        }

        let frequencies = masses
            .into_iter()
            .filter(|(_, v)| *v > 0.0)
            .map(|(token, v)| (token, v / total))
            .collect();

        Self { frequencies }
    }

    pub fn get(&self, token: &str) -> f64 {
        self.frequencies.get(token).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.frequencies.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.frequencies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Sum of all frequencies: 1 for a non-empty profile, 0 otherwise
    pub fn total(&self) -> f64 {
        self.frequencies.values().sum()
    }
}

/// Per-token weights in [0, 1) favoring tokens over-represented in one user's history
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelevanceWeights {
    weights: BTreeMap<String, f64>,
}

impl RelevanceWeights {
    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        Self { weights }
    }

    /// Weight of a token, 0 when neither population has seen it
    pub fn get(&self, token: &str) -> f64 {
        self.weights.get(token).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}
