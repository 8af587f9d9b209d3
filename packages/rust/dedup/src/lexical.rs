//! Tier 1: cheap lexical similarity, no external cost.

use std::collections::HashSet;

use crate::normalize::{normalize_name, tokens};

/// Score for one name fully containing the other.
pub const CONTAINMENT_SCORE: f64 = 0.9;

/// Similarity of two names in `[0, 1]`.
///
/// Exact normalized match scores 1.0, and one name's tokens appearing as a
/// contiguous run inside the other's scores 0.9. Otherwise the score is the
/// Jaccard overlap of the token sets.
pub fn lexical_similarity(a: &str, b: &str) -> f64 {
    let (na, nb) = (normalize_name(a), normalize_name(b));
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    if na == nb {
        return 1.0;
    }
    let (sa, sb): (Vec<&str>, Vec<&str>) = (tokens(&na).collect(), tokens(&nb).collect());
    if contains_run(&sa, &sb) || contains_run(&sb, &sa) {
        return CONTAINMENT_SCORE;
    }

    let ta: HashSet<&str> = sa.into_iter().collect();
    let tb: HashSet<&str> = sb.into_iter().collect();
    let union = ta.union(&tb).count();
    if union == 0 {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / union as f64
}

/// Whether `needle` occurs as whole consecutive tokens in `haystack`.
fn contains_run(haystack: &[&str], needle: &[&str]) -> bool {
    !needle.is_empty()
        && needle.len() <= haystack.len()
        && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_names_score_one() {
        for name in ["Aba", "Girl & the Goat", "Alinea (Chicago)"] {
            assert_eq!(lexical_similarity(name, name), 1.0);
        }
        assert_eq!(lexical_similarity("Girl & the Goat", "girl and the goat"), 1.0);
    }

    #[test]
    fn containment_scores_point_nine() {
        assert_eq!(lexical_similarity("Aba", "Aba Chicago"), 0.9);
        assert_eq!(lexical_similarity("Aba Chicago", "Aba"), 0.9);
        assert_eq!(lexical_similarity("The Aba Rooftop Bar", "aba rooftop"), 0.9);
    }

    #[test]
    fn partial_words_are_not_containment() {
        // "aba" only appears inside "kabab".
        assert_eq!(lexical_similarity("Aba", "Kabab House"), 0.0);
        assert!(lexical_similarity("Bar", "Barbara") < 0.3);
    }

    #[test]
    fn token_overlap() {
        // {little, goat, diner} vs {little, goat, bread}: 2 / 4
        let score = lexical_similarity("Little Goat Diner", "Little Goat Bread");
        assert!((score - 0.5).abs() < 1e-9);
        assert!(lexical_similarity("Alinea", "Smyth") < 0.3);
        assert_eq!(lexical_similarity("", "Smyth"), 0.0);
    }
}
