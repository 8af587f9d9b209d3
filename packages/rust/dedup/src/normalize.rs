//! Name normalization shared by the lexical tier and the identity gate.

use std::sync::LazyLock;

use regex::Regex;

static PARENTHETICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)|\[[^\]]*\]").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}]+").expect("valid regex"));

/// Normalize a display name for comparison.
///
/// Strips parentheticals, unifies quote glyphs, maps `&` to `and`, collapses
/// whitespace, and lowercases.
pub fn normalize_name(name: &str) -> String {
    let stripped = PARENTHETICAL.replace_all(name, " ");
    let unified: String = stripped
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201B}' | '\u{02BC}' | '`' | '\u{00B4}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201F}' => '"',
            other => other,
        })
        .collect();
    let anded = unified.replace('&', " and ");
    WHITESPACE
        .replace_all(anded.trim(), " ")
        .to_lowercase()
}

/// Punctuation-insensitive key: `"TOP.CHEF!!"` and `"Top Chef"` both give `"top chef"`.
///
/// Apostrophes are dropped rather than split on, and a leading `the` is
/// removed.
pub fn identity_key(name: &str) -> String {
    let normalized = normalize_name(name).replace('\'', "");
    let spaced = NON_ALNUM.replace_all(&normalized, " ");
    let key = spaced.trim();
    key.strip_prefix("the ").unwrap_or(key).to_string()
}

/// Normalize a city or state for equality checks (`"St. Louis"` == `"st louis"`).
pub fn normalize_place(place: &str) -> String {
    identity_key(place)
}

/// Tokens used by the set-overlap score.
pub(crate) fn tokens(normalized: &str) -> impl Iterator<Item = &str> {
    normalized
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_and_unifies() {
        assert_eq!(normalize_name("  Girl  & the Goat (West Loop) "), "girl and the goat");
        assert_eq!(normalize_name("Joe\u{2019}s Stone Crab"), "joe's stone crab");
        assert_eq!(normalize_name("Joe's Stone Crab"), normalize_name("Joe\u{2019}s  stone crab"));
    }

    #[test]
    fn identity_ignores_punctuation() {
        assert_eq!(identity_key("Top Chef"), "top chef");
        assert_eq!(identity_key("TOP.CHEF!!"), "top chef");
        assert_eq!(identity_key("Hell's Kitchen"), "hells kitchen");
        assert_eq!(identity_key("The Great British Bake Off"), "great british bake off");
        assert_eq!(identity_key("Diners, Drive-Ins & Dives"), "diners drive ins and dives");
    }

    #[test]
    fn places_compare_loosely() {
        assert_eq!(normalize_place("St. Louis"), normalize_place("st louis"));
        assert_ne!(normalize_place("Chicago"), normalize_place("Evanston"));
    }
}
