//! Boolean composition of selector results.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::selector::{FieldSelector, LabelSelector};

/// How the results of a matcher's selectors are combined.
///
/// Parsed from a case-insensitive token at configuration-load time; no
/// string comparison happens during evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BooleanOperator {
    #[default]
    And,
    Or,
    Xor,
}

impl BooleanOperator {
    fn combine(self, results: impl IntoIterator<Item = bool>) -> bool {
        match self {
            BooleanOperator::And => results.into_iter().all(|r| r),
            BooleanOperator::Or => results.into_iter().any(|r| r),
            BooleanOperator::Xor => results.into_iter().filter(|r| *r).count() % 2 == 1,
        }
    }
}

impl FromStr for BooleanOperator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AND" => Ok(BooleanOperator::And),
            "OR" => Ok(BooleanOperator::Or),
            "XOR" => Ok(BooleanOperator::Xor),
            _ => Err(Error::Config(format!(
                "unknown boolean operator {s:?}, expected AND, OR or XOR"
            ))),
        }
    }
}

impl fmt::Display for BooleanOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            BooleanOperator::And => "AND",
            BooleanOperator::Or => "OR",
            BooleanOperator::Xor => "XOR",
        };
        f.write_str(token)
    }
}

impl<'de> Deserialize<'de> for BooleanOperator {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        token.parse().map_err(serde::de::Error::custom)
    }
}

/// Decides whether a rule applies to an object.
///
/// Every selector is evaluated to a boolean and the results are combined
/// under the operator in configuration order, label selectors first.
#[derive(Debug, Clone)]
pub struct Matcher {
    label_selectors: Vec<LabelSelector>,
    field_selectors: Vec<FieldSelector>,
    operator: BooleanOperator,
}

impl Matcher {
    pub fn new(
        label_selectors: &[String],
        field_selectors: &[String],
        operator: BooleanOperator,
    ) -> Result<Self> {
        Ok(Self {
            label_selectors: label_selectors
                .iter()
                .map(|s| s.parse())
                .collect::<Result<_>>()?,
            field_selectors: field_selectors
                .iter()
                .map(|s| s.parse())
                .collect::<Result<_>>()?,
            operator,
        })
    }

    /// Matcher with no selectors at all; matches everything under AND.
    pub fn match_all() -> Self {
        Self {
            label_selectors: Vec::new(),
            field_selectors: Vec::new(),
            operator: BooleanOperator::And,
        }
    }

    pub fn matches(&self, object: &Value) -> bool {
        let empty = Map::new();
        let labels = object
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let results = self
            .label_selectors
            .iter()
            .map(|s| s.matches(labels))
            .chain(self.field_selectors.iter().map(|s| s.matches(object)))
            .collect::<Vec<_>>();

        self.operator.combine(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matcher(labels: &[&str], fields: &[&str], operator: BooleanOperator) -> Matcher {
        let labels: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let fields: Vec<String> = fields.iter().map(|s| s.to_string()).collect();
        Matcher::new(&labels, &fields, operator).unwrap()
    }

    #[test]
    fn empty_selector_sets_are_operator_identities() {
        let object = json!({"metadata": {"name": "thing"}});
        assert!(matcher(&[], &[], BooleanOperator::And).matches(&object));
        assert!(!matcher(&[], &[], BooleanOperator::Or).matches(&object));
        assert!(!matcher(&[], &[], BooleanOperator::Xor).matches(&object));
    }

    #[test]
    fn and_requires_every_selector() {
        let m = matcher(
            &["app=web"],
            &["metadata.namespace=default"],
            BooleanOperator::And,
        );
        assert!(m.matches(&json!({
            "metadata": {"namespace": "default", "labels": {"app": "web"}}
        })));
        assert!(!m.matches(&json!({
            "metadata": {"namespace": "other", "labels": {"app": "web"}}
        })));
    }

    #[test]
    fn or_requires_any_selector() {
        let m = matcher(
            &["app=web"],
            &["metadata.namespace=default"],
            BooleanOperator::Or,
        );
        assert!(m.matches(&json!({
            "metadata": {"namespace": "other", "labels": {"app": "web"}}
        })));
        assert!(m.matches(&json!({"metadata": {"namespace": "default"}})));
        assert!(!m.matches(&json!({"metadata": {"namespace": "other"}})));
    }

    // env=prod XOR namespace=kube-system
    #[test]
    fn xor_is_odd_parity_across_the_whole_vector() {
        let m = matcher(
            &["env=prod"],
            &["metadata.namespace=kube-system"],
            BooleanOperator::Xor,
        );
        assert!(m.matches(&json!({
            "metadata": {"namespace": "default", "labels": {"env": "prod"}}
        })));
        assert!(!m.matches(&json!({
            "metadata": {"namespace": "kube-system", "labels": {"env": "prod"}}
        })));
        assert!(!m.matches(&json!({"metadata": {"namespace": "default"}})));
    }

    #[test]
    fn objects_without_labels_evaluate_against_an_empty_map() {
        let m = matcher(&["env!=prod"], &[], BooleanOperator::And);
        assert!(m.matches(&json!({"metadata": {"name": "unlabelled"}})));
    }

    #[test]
    fn operator_tokens_parse_case_insensitively() {
        for token in ["and", "And", "AND"] {
            assert_eq!(
                token.parse::<BooleanOperator>().unwrap(),
                BooleanOperator::And
            );
        }
        assert_eq!(
            "xor".parse::<BooleanOperator>().unwrap(),
            BooleanOperator::Xor
        );
        assert!("nand".parse::<BooleanOperator>().is_err());
    }

    #[test]
    fn operator_deserializes_from_yaml_tokens() {
        let operator: BooleanOperator = serde_yaml::from_str("oR").unwrap();
        assert_eq!(operator, BooleanOperator::Or);
    }

    #[test]
    fn invalid_selectors_are_rejected_at_construction() {
        assert!(Matcher::new(&["=bad".into()], &[], BooleanOperator::And).is_err());
        assert!(Matcher::new(&[], &["no-operator".into()], BooleanOperator::And).is_err());
    }
}
