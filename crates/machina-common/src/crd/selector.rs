//! Node label selectors for pools
//!
//! Mirrors the Kubernetes `LabelSelector` shape (`matchLabels` plus
//! `matchExpressions`). Unlike most selector users, an empty selector here
//! selects **nothing**: a pool with a missing or empty selector must never
//! claim every node in the cluster.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Operator for label selector requirements
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    /// Label value must be in the specified set
    In,
    /// Label value must not be in the specified set
    NotIn,
    /// Label must exist (value ignored)
    Exists,
    /// Label must not exist (value ignored)
    DoesNotExist,
}

impl LabelSelectorOperator {
    /// Check if a label value satisfies this operator
    ///
    /// `label_value` is `None` when the label is absent.
    pub fn matches(&self, label_value: Option<&str>, values: &[String]) -> bool {
        match self {
            Self::In => label_value.is_some_and(|v| values.iter().any(|req| req == v)),
            Self::NotIn => {
                label_value.is_none() || !values.iter().any(|req| Some(req.as_str()) == label_value)
            }
            Self::Exists => label_value.is_some(),
            Self::DoesNotExist => label_value.is_none(),
        }
    }
}

/// A single `matchExpressions` entry
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// The label key that the selector applies to
    pub key: String,

    /// Relationship between the label and `values`
    pub operator: LabelSelectorOperator,

    /// Values for `In`/`NotIn`; empty for `Exists`/`DoesNotExist`
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    /// Check if a label set satisfies this requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key).map(|s| s.as_str());
        self.operator.matches(value, &self.values)
    }
}

/// Node selector attached to a pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    /// Exact label matches; all must hold
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// Expression requirements; all must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl NodeSelector {
    /// Selector requiring a single label to equal a value
    pub fn with_label(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            match_labels: BTreeMap::from([(key.into(), value.into())]),
            match_expressions: Vec::new(),
        }
    }

    /// True if the selector has no requirements at all
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Check if node labels match this selector
    ///
    /// An empty selector matches nothing.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        if self.is_empty() {
            return false;
        }

        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }

        self.match_expressions.iter().all(|req| req.matches(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_nothing() {
        let selector = NodeSelector::default();
        assert!(!selector.matches(&labels(&[])));
        assert!(!selector.matches(&labels(&[("node-role.kubernetes.io/worker", "")])));
    }

    #[test]
    fn match_labels_require_every_pair() {
        let selector = NodeSelector {
            match_labels: labels(&[("role", "infra"), ("zone", "a")]),
            match_expressions: vec![],
        };
        assert!(selector.matches(&labels(&[("role", "infra"), ("zone", "a"), ("x", "y")])));
        assert!(!selector.matches(&labels(&[("role", "infra")])));
    }

    #[rstest]
    #[case::in_present(LabelSelectorOperator::In, Some("a"), true)]
    #[case::in_other(LabelSelectorOperator::In, Some("c"), false)]
    #[case::in_absent(LabelSelectorOperator::In, None, false)]
    #[case::not_in_other(LabelSelectorOperator::NotIn, Some("c"), true)]
    #[case::not_in_present(LabelSelectorOperator::NotIn, Some("a"), false)]
    #[case::not_in_absent(LabelSelectorOperator::NotIn, None, true)]
    #[case::exists(LabelSelectorOperator::Exists, Some(""), true)]
    #[case::exists_absent(LabelSelectorOperator::Exists, None, false)]
    #[case::does_not_exist(LabelSelectorOperator::DoesNotExist, None, true)]
    #[case::does_not_exist_present(LabelSelectorOperator::DoesNotExist, Some("a"), false)]
    fn operators(
        #[case] op: LabelSelectorOperator,
        #[case] value: Option<&str>,
        #[case] expected: bool,
    ) {
        let values = vec!["a".to_string(), "b".to_string()];
        assert_eq!(op.matches(value, &values), expected);
    }

    #[test]
    fn expression_only_selector_is_not_empty() {
        let selector = NodeSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![LabelSelectorRequirement {
                key: "node-role.kubernetes.io/infra".to_string(),
                operator: LabelSelectorOperator::Exists,
                values: vec![],
            }],
        };
        assert!(!selector.is_empty());
        assert!(selector.matches(&labels(&[("node-role.kubernetes.io/infra", "")])));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let json = r#"{"matchExpressions":[{"key":"a","operator":"Near","values":[]}]}"#;
        assert!(serde_json::from_str::<NodeSelector>(json).is_err());
    }
}
