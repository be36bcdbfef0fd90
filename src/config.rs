//! Configuration model and validation.
//!
//! The configuration is a single YAML document with kebab-case keys.
//! Unknown keys are rejected, selector strings must parse, rule names must
//! be unique, and every rule must add at least one label or annotation —
//! all checked at load time so that evaluation can never fail.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::matcher::{BooleanOperator, Matcher};
use crate::rule::{Additions, Rule};

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Configuration {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Any truthy representation enables the existing-object pass.
    #[serde(default, deserialize_with = "truthy")]
    pub check_existing: bool,
    #[serde(default)]
    pub health_checker: HealthChecker,
    pub server: Server,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct HealthChecker {
    #[serde(default = "default_health_port")]
    pub port: u16,
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self {
            port: default_health_port(),
            path: default_health_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Server {
    #[serde(default = "default_webhook_port")]
    pub port: u16,
    #[serde(default = "default_company_domain")]
    pub company_domain: String,
    pub namespace: String,
    pub service: String,
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: PathBuf,
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RuleConfig {
    pub registration: Registration,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub additions: Additions,
}

/// How a rule presents itself to the apiserver: which resources it
/// intercepts and under which failure policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Registration {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Standard LabelSelector schema, camelCase keys as the platform spells them.
    #[serde(default)]
    pub namespace_selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Target {
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub api_versions: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum FailurePolicy {
    #[default]
    Ignore,
    Fail,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::Ignore => "Ignore",
            FailurePolicy::Fail => "Fail",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MatcherConfig {
    #[serde(default)]
    pub label_selectors: Vec<String>,
    #[serde(default)]
    pub field_selectors: Vec<String>,
    #[serde(default)]
    pub boolean_operator: BooleanOperator,
}

impl Configuration {
    /// Read, parse and validate the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: Configuration = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(Error::Config(format!(
                "{:?} is not a valid log-level, expected one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        let probe = self.health_checker.path.trim_matches('/');
        if probe.is_empty() || probe.contains('/') {
            return Err(Error::Config(format!(
                "health-checker.path {:?} must be a single path segment",
                self.health_checker.path
            )));
        }
        self.rules().map(drop)
    }

    /// Compile the configured rules into their immutable runtime form.
    pub fn rules(&self) -> Result<Vec<Rule>> {
        let mut names = HashSet::new();
        self.rules.iter().map(|r| r.compile(&mut names)).collect()
    }
}

impl RuleConfig {
    fn compile(&self, names: &mut HashSet<String>) -> Result<Rule> {
        let name = &self.registration.name;
        if !valid_rule_name(name) {
            return Err(Error::Config(format!(
                "rule name {name:?} must be a lowercase DNS-style name"
            )));
        }
        if !names.insert(name.clone()) {
            return Err(Error::Config(format!(
                "rule {name:?} declared twice, rule names must be unique"
            )));
        }
        if self.additions.is_empty() {
            return Err(Error::Config(format!(
                "rule {name:?} adds no labels and no annotations"
            )));
        }
        for key in self.additions.labels.keys().chain(self.additions.annotations.keys()) {
            if !valid_metadata_key(key) {
                return Err(Error::Config(format!(
                    "rule {name:?} has a malformed addition key {key:?}"
                )));
            }
        }
        let matcher = Matcher::new(
            &self.matcher.label_selectors,
            &self.matcher.field_selectors,
            self.matcher.boolean_operator,
        )?;
        Ok(Rule {
            name: name.clone(),
            matcher,
            additions: self.additions.clone(),
            registration: self.registration.clone(),
        })
    }
}

/// Rule names become URL path segments and webhook configuration names.
fn valid_rule_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Light key check; the apiserver re-validates every patched object.
fn valid_metadata_key(key: &str) -> bool {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] => valid_key_part(name),
        [prefix, name] => valid_key_part(prefix) && valid_key_part(name),
        _ => false,
    }
}

fn valid_key_part(part: &str) -> bool {
    !part.is_empty() && !part.contains(char::is_whitespace)
}

fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::Null => Ok(false),
        serde_yaml::Value::Bool(b) => Ok(b),
        serde_yaml::Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        serde_yaml::Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" | "" => Ok(false),
            _ => Err(serde::de::Error::custom(format!(
                "check-existing: unrecognized value {s:?}"
            ))),
        },
        _ => Err(serde::de::Error::custom(
            "check-existing must be a boolean-like scalar",
        )),
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_health_port() -> u16 {
    8080
}

fn default_health_path() -> String {
    "/healthz".to_owned()
}

fn default_webhook_port() -> u16 {
    8443
}

fn default_company_domain() -> String {
    "acme.com".to_owned()
}

fn default_ca_cert_path() -> PathBuf {
    PathBuf::from("/ca.pem")
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("/server.pem")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/key.pem")
}
