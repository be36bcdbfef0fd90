//! Rules: a matcher paired with the labels and annotations it paints on.

use indexmap::IndexMap;
use json_patch::Patch;
use serde::Deserialize;
use serde_json::Value;

use crate::config::Registration;
use crate::matcher::Matcher;
use crate::patch;

/// The labels and annotations a rule ensures are present.
///
/// Both mappings preserve the order of the configuration document; patch
/// operations are emitted in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Additions {
    #[serde(default)]
    pub labels: IndexMap<String, String>,
    #[serde(default)]
    pub annotations: IndexMap<String, String>,
}

impl Additions {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

/// A named evaluation unit: decide whether an object qualifies, and if so
/// which metadata additions it receives.
///
/// Built once from configuration and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub matcher: Matcher,
    pub additions: Additions,
    pub registration: Registration,
}

impl Rule {
    /// The engine step: run the matcher, then synthesize a patch.
    ///
    /// Returns `None` when the object does not match or already carries
    /// every addition. Pure; the object is never mutated.
    pub fn evaluate(&self, object: &Value) -> Option<Patch> {
        if !self.matcher.matches(object) {
            return None;
        }
        patch::synthesize(object, &self.additions)
    }
}
