//! Near-duplicate detection for candidate facts
//!
//! Texts are normalized (lowercased, punctuation stripped, single-character
//! tokens dropped) and compared by Jaccard similarity of their token sets.

use super::record::MemoryRecord;
use std::collections::HashSet;

/// Default similarity at which two facts are considered the same
pub const DEFAULT_DUPLICATE_THRESHOLD: f64 = 0.7;

/// Normalize text into comparison tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();

    cleaned
        .split_whitespace()
        .filter(|token| token.chars().count() > 1)
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity `|A∩B| / |A∪B|` of two token sets; 0.0 when both are empty.
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    intersection as f64 / union as f64
}

/// Whether `candidate` is a near-duplicate of any record in `existing`.
pub fn is_duplicate(candidate: &str, existing: &[MemoryRecord], threshold: f64) -> bool {
    let candidate_tokens = tokenize(candidate);
    let candidate_normalized = candidate_tokens.join(" ");
    let candidate_set: HashSet<String> = candidate_tokens.into_iter().collect();

    existing.iter().any(|record| {
        let tokens = tokenize(&record.content);
        if tokens.join(" ") == candidate_normalized {
            return true;
        }
        let set: HashSet<String> = tokens.into_iter().collect();
        jaccard_similarity(&candidate_set, &set) >= threshold
    })
}
