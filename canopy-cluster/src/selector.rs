//! Cluster selector expressions
//!
//! A selector is a comma-separated list of regular expressions. A cluster
//! name is selected when any trimmed pattern matches it. Patterns that fail
//! to compile are kept as placeholders that never match.

use regex::Regex;

/// Compiled selector expression
#[derive(Debug, Clone)]
pub struct Selector {
    patterns: Vec<Option<Regex>>,
}

impl Selector {
    /// Compile a selector expression
    pub fn new(expr: &str) -> Self {
        let patterns = expr
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::debug!(pattern = %p, error = %e, "Ignoring invalid selector pattern");
                    None
                }
            })
            .collect();

        Self { patterns }
    }

    /// Returns true iff any pattern matches `name`
    pub fn has(&self, name: &str) -> bool {
        self.patterns
            .iter()
            .flatten()
            .any(|re| re.is_match(name))
    }

    /// Whether the selector has no patterns at all
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Names from `names` that this selector matches, in input order
    pub fn filter<'a, I>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        names
            .into_iter()
            .filter(|n| self.has(n))
            .cloned()
            .collect()
    }
}

/// Join cluster names into a selector expression, one name per pattern
pub fn clusters_to_selector<S: AsRef<str>>(names: &[S]) -> String {
    names.iter().map(|n| n.as_ref()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_matches_any_pattern() {
        let sel = Selector::new("edge-.*, core-1");
        assert!(sel.has("edge-7"));
        assert!(sel.has("core-1"));
        assert!(!sel.has("hub"));
    }

    #[test]
    fn test_empty_matches_nothing() {
        let sel = Selector::new("");
        assert!(sel.is_empty());
        assert!(!sel.has(""));
        assert!(!sel.has("c1"));

        let sel = Selector::new(" , ,");
        assert!(sel.is_empty());
    }

    #[test]
    fn test_invalid_pattern_never_matches() {
        let sel = Selector::new("c[1,c2");
        // "c[1" is invalid and ignored, "c2" still works
        assert!(!sel.has("c1"));
        assert!(sel.has("c2"));
    }

    #[test]
    fn test_clusters_to_selector() {
        assert_eq!(clusters_to_selector(&["a", "b", "c"]), "a,b,c");
        assert_eq!(clusters_to_selector(&["c2"]), "c2");
        assert_eq!(clusters_to_selector::<&str>(&[]), "");
    }

    #[test]
    fn test_filter_preserves_order() {
        let sel = Selector::new("c2,c3");
        let names = vec!["c3".to_string(), "c1".to_string(), "c2".to_string()];
        assert_eq!(sel.filter(&names), vec!["c3".to_string(), "c2".to_string()]);
    }

    proptest! {
        #[test]
        fn prop_selector_round_trip(names in prop::collection::vec("[a-m][a-m0-9.-]{0,6}", 1..8)) {
            let sel = Selector::new(&clusters_to_selector(&names));
            for n in &names {
                prop_assert!(sel.has(n));
            }
            // control names use a disjoint alphabet
            for control in ["xyz", "q-1", "zz9"] {
                prop_assert!(!sel.has(control));
            }
        }
    }
}
