//! Selector parsing and evaluation.
//!
//! Two grammars are supported: label selectors in the platform's standard
//! form (`key`, `!key`, `key=value`, `key!=value`, `key in (v1,v2)`,
//! `key notin (v1,v2)`, comma-separated) and field selectors restricted to
//! equality and inequality over dotted paths into the object document.
//!
//! Selector strings are parsed once when the configuration is loaded;
//! evaluation cannot fail.

use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::Error;

/// A parsed label selector, evaluated against `metadata.labels`.
///
/// Matches when every requirement is satisfied; the empty selector matches
/// everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Exists(String),
    NotExists(String),
    Equal(String, String),
    NotEqual(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
}

impl Requirement {
    fn satisfied(&self, labels: &Map<String, Value>) -> bool {
        let value_of = |key: &str| labels.get(key).and_then(Value::as_str);
        match self {
            Requirement::Exists(key) => labels.contains_key(key),
            Requirement::NotExists(key) => !labels.contains_key(key),
            Requirement::Equal(key, want) => value_of(key) == Some(want.as_str()),
            // absent keys satisfy the negated operators
            Requirement::NotEqual(key, want) => value_of(key) != Some(want.as_str()),
            Requirement::In(key, set) => {
                value_of(key).is_some_and(|v| set.iter().any(|s| s == v))
            }
            Requirement::NotIn(key, set) => {
                !value_of(key).is_some_and(|v| set.iter().any(|s| s == v))
            }
        }
    }
}

impl LabelSelector {
    pub fn matches(&self, labels: &Map<String, Value>) -> bool {
        self.requirements.iter().all(|r| r.satisfied(labels))
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let requirements = split_requirements(s)
            .into_iter()
            .map(|piece| parse_requirement(s, piece))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { requirements })
    }
}

/// Split a selector on commas that are not inside a parenthesised value set.
fn split_requirements(s: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                pieces.push(&s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    pieces.push(&s[start..]);
    pieces
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

fn parse_requirement(selector: &str, piece: &str) -> Result<Requirement, Error> {
    if let Some((key, set)) = split_set_expression(piece, " notin ") {
        return Ok(Requirement::NotIn(
            parse_key(selector, key)?,
            parse_value_set(selector, set)?,
        ));
    }
    if let Some((key, set)) = split_set_expression(piece, " in ") {
        return Ok(Requirement::In(
            parse_key(selector, key)?,
            parse_value_set(selector, set)?,
        ));
    }
    if let Some((key, value)) = piece.split_once("!=") {
        return Ok(Requirement::NotEqual(
            parse_key(selector, key)?,
            value.trim().to_owned(),
        ));
    }
    if let Some((key, value)) = piece.split_once("==") {
        return Ok(Requirement::Equal(
            parse_key(selector, key)?,
            value.trim().to_owned(),
        ));
    }
    if let Some((key, value)) = piece.split_once('=') {
        return Ok(Requirement::Equal(
            parse_key(selector, key)?,
            value.trim().to_owned(),
        ));
    }
    if let Some(key) = piece.strip_prefix('!') {
        return Ok(Requirement::NotExists(parse_key(selector, key)?));
    }
    Ok(Requirement::Exists(parse_key(selector, piece)?))
}

fn split_set_expression<'a>(piece: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, set) = piece.split_once(op)?;
    Some((key, set.trim()))
}

fn parse_key(selector: &str, key: &str) -> Result<String, Error> {
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::selector(selector, "empty key"));
    }
    if key.contains(|c: char| c.is_whitespace() || matches!(c, ',' | '(' | ')' | '=' | '!')) {
        return Err(Error::selector(selector, format!("malformed key {key:?}")));
    }
    Ok(key.to_owned())
}

fn parse_value_set(selector: &str, set: &str) -> Result<Vec<String>, Error> {
    let inner = set
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| Error::selector(selector, "set values must be parenthesised"))?;
    let values: Vec<String> = inner
        .split(',')
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return Err(Error::selector(selector, "empty value set"));
    }
    Ok(values)
}

/// A parsed field selector, evaluated against the whole object document.
///
/// Only equality (`=`, `==`) and inequality (`!=`) are supported. Paths are
/// dotted; every segment is treated as a mapping key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelector {
    requirements: Vec<FieldRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldRequirement {
    path: Vec<String>,
    value: String,
    negated: bool,
}

impl FieldRequirement {
    fn satisfied(&self, object: &Value) -> bool {
        match resolve(object, &self.path) {
            // an unresolvable path only satisfies `!=`
            None => self.negated,
            Some(actual) => (actual == self.value) != self.negated,
        }
    }
}

/// Walk the document along `path` and render the terminal scalar as text.
fn resolve(object: &Value, path: &[String]) -> Option<String> {
    let mut current = object;
    for segment in path {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl FieldSelector {
    pub fn matches(&self, object: &Value) -> bool {
        self.requirements.iter().all(|r| r.satisfied(object))
    }
}

impl FromStr for FieldSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let requirements = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|piece| parse_field_requirement(s, piece))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { requirements })
    }
}

fn parse_field_requirement(selector: &str, piece: &str) -> Result<FieldRequirement, Error> {
    let (path, value, negated) = if let Some((path, value)) = piece.split_once("!=") {
        (path, value, true)
    } else if let Some((path, value)) = piece.split_once("==") {
        (path, value, false)
    } else if let Some((path, value)) = piece.split_once('=') {
        (path, value, false)
    } else {
        return Err(Error::selector(
            selector,
            format!("missing operator in {piece:?}"),
        ));
    };
    let segments: Vec<String> = path.trim().split('.').map(str::to_owned).collect();
    if segments.iter().any(String::is_empty) {
        return Err(Error::selector(selector, format!("malformed path {path:?}")));
    }
    Ok(FieldRequirement {
        path: segments,
        value: value.trim().to_owned(),
        negated,
    })
}
