//! Textual relation between two observations.
//!
//! Observations are reduced to sets of content tokens plus a negation
//! polarity. Two observations with the same polarity and a high overlap are
//! duplicates; opposite polarity with a high overlap is a contradiction.

use std::collections::BTreeSet;

/// Tunable cut-offs for [`relate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityThresholds {
    /// Minimum overlap for a same-polarity pair to count as a duplicate.
    pub duplicate: f64,
    /// Minimum overlap for an opposite-polarity pair to count as a contradiction.
    pub contradiction: f64,
}

impl Default for SimilarityThresholds {
    fn default() -> Self {
        Self {
            duplicate: 0.6,
            contradiction: 0.5,
        }
    }
}

/// How an incoming observation relates to an existing one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Relation {
    Duplicate { score: f64 },
    Contradiction { score: f64 },
    Unrelated,
}

impl Relation {
    pub fn score(&self) -> f64 {
        match self {
            Self::Duplicate { score } | Self::Contradiction { score } => *score,
            Self::Unrelated => 0.0,
        }
    }
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "to", "of", "in", "on",
    "at", "for", "and", "or", "it", "its", "this", "that", "with", "by", "as", "do", "does",
    "did", "has", "have", "had", "will", "can", "so", "very",
];

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "none", "nothing", "without", "cannot", "neither", "nor",
];

/// Token set of an observation with its negation polarity.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Tokens {
    words: BTreeSet<String>,
    negated: bool,
}

fn is_negation(word: &str) -> bool {
    NEGATIONS.contains(&word) || word.ends_with("n't")
}

fn stem(word: &str) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

fn tokenize(text: &str) -> Tokens {
    let lower = text.to_lowercase();
    let mut words = BTreeSet::new();
    let mut negations = 0usize;

    for raw in lower.split(|c: char| !(c.is_alphanumeric() || c == '\'')) {
        let word = raw.trim_matches('\'');
        if word.is_empty() {
            continue;
        }
        if is_negation(word) {
            negations += 1;
            continue;
        }
        if STOP_WORDS.contains(&word) {
            continue;
        }
        words.insert(stem(word));
    }

    Tokens {
        words,
        negated: negations % 2 == 1,
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Classify `incoming` against `existing`.
pub fn relate(existing: &str, incoming: &str, thresholds: &SimilarityThresholds) -> Relation {
    let a = tokenize(existing);
    let b = tokenize(incoming);
    let score = jaccard(&a.words, &b.words);

    if a.negated == b.negated {
        if score >= thresholds.duplicate {
            return Relation::Duplicate { score };
        }
    } else if score >= thresholds.contradiction {
        return Relation::Contradiction { score };
    }
    Relation::Unrelated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relate_default(a: &str, b: &str) -> Relation {
        relate(a, b, &SimilarityThresholds::default())
    }

    #[test]
    fn test_rephrasing_is_duplicate() {
        let relation = relate_default(
            "Jellyfin takes 90 seconds to become healthy after restart",
            "jellyfin takes about 90 seconds to become healthy after a restart",
        );
        assert!(matches!(relation, Relation::Duplicate { .. }), "{:?}", relation);
    }

    #[test]
    fn test_identical_text_scores_one() {
        let relation = relate_default("nginx reloads config on SIGHUP", "nginx reloads config on SIGHUP");
        assert_eq!(relation, Relation::Duplicate { score: 1.0 });
    }

    #[test]
    fn test_negated_statement_contradicts() {
        let relation = relate_default(
            "jellyfin needs a restart after updates",
            "jellyfin does not need a restart after updates",
        );
        assert!(matches!(relation, Relation::Contradiction { .. }), "{:?}", relation);

        let relation = relate_default(
            "postgres recovers on its own after a crash",
            "postgres doesn't recover on its own after a crash",
        );
        assert!(matches!(relation, Relation::Contradiction { .. }), "{:?}", relation);
    }

    #[test]
    fn test_double_negation_keeps_polarity() {
        let relation = relate_default(
            "backups never run without the nas mounted",
            "backups run with the nas mounted",
        );
        // Two negations cancel, so the pair is not a contradiction.
        assert!(!matches!(relation, Relation::Contradiction { .. }));
    }

    #[test]
    fn test_unrelated_observations() {
        let relation = relate_default(
            "redis memory usage spikes at midnight",
            "traefik certificates renew every sixty days",
        );
        assert_eq!(relation, Relation::Unrelated);
    }

    #[test]
    fn test_empty_text_is_unrelated() {
        assert_eq!(relate_default("", "the a an"), Relation::Unrelated);
    }

    #[test]
    fn test_thresholds_are_tunable() {
        let strict = SimilarityThresholds {
            duplicate: 0.95,
            contradiction: 0.95,
        };
        let relation = relate(
            "jellyfin takes 90 seconds to start",
            "jellyfin takes about 90 seconds to start",
            &strict,
        );
        assert_eq!(relation, Relation::Unrelated);
    }

    #[test]
    fn test_stemming_and_stop_words() {
        let tokens = tokenize("The containers restarts quickly, doesn't it?");
        assert!(tokens.negated);
        assert!(tokens.words.contains("container"));
        assert!(tokens.words.contains("restart"));
        assert!(!tokens.words.contains("the"));
        assert_eq!(stem("process"), "process");
    }
}
