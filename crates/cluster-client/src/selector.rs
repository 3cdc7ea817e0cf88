//! Equality-based label selectors

use std::collections::BTreeMap;

/// Conjunction of `key=value` requirements.
///
/// The tenancy model only ever selects by exact label equality, so set-based
/// requirements are not supported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector matching every object
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn label(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and(key, value)
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Value required for `key`, if the selector constrains it
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.requirements.get(key).map(String::as_str)
    }

    /// True when every requirement is satisfied by `labels`
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    /// Wire form for the `labelSelector` query parameter
    pub fn to_query(&self) -> String {
        self.requirements
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_matches_requires_exact_value() {
        let sel = LabelSelector::label("go.kuber.io/tenant", "acme");
        assert!(sel.matches(&labels(&[("go.kuber.io/tenant", "acme"), ("x", "y")])));
        assert!(!sel.matches(&labels(&[("go.kuber.io/tenant", "acme2")])));
        assert!(!sel.matches(&labels(&[])));
    }

    #[test]
    fn test_everything_matches_all() {
        assert!(LabelSelector::everything().matches(&labels(&[])));
        assert_eq!(LabelSelector::everything().to_query(), "");
    }

    #[test]
    fn test_value_of_reads_requirement() {
        let sel = LabelSelector::label("go.kuber.io/tenant", "acme").and("go.kuber.io/project", "web");
        assert_eq!(sel.value_of("go.kuber.io/tenant"), Some("acme"));
        assert_eq!(sel.value_of("go.kuber.io/zone"), None);
    }

    #[test]
    fn test_query_is_sorted() {
        let sel = LabelSelector::label("b", "2").and("a", "1");
        assert_eq!(sel.to_query(), "a=1,b=2");
    }
}
