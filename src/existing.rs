//! Retroactive application of rules to objects already in the cluster.
//!
//! Runs once at startup, before the webhook server accepts traffic. Each
//! rule's registration targets are resolved against API discovery, the
//! matching kinds are listed cluster-wide page by page, and every matching
//! object is patched through the JSON-Patch content type. Individual
//! failures are logged and skipped; only a blanket authorization failure
//! across every kind is fatal. A shutdown flag is checked between objects
//! and between kinds, so an in-flight list or patch call always completes
//! before the walker stops.

use std::sync::atomic::{AtomicBool, Ordering};

use kube::api::{Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::{verbs, Discovery};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::config::Target;
use crate::error::{Error, Result};
use crate::patch;
use crate::rule::Rule;

const PAGE_LIMIT: u32 = 500;

#[derive(Debug, Default)]
struct Outcome {
    kinds: usize,
    kinds_denied: usize,
    patched: usize,
    unchanged: usize,
    skipped: usize,
    failed: usize,
}

impl Outcome {
    fn absorb(&mut self, other: &Outcome) {
        self.kinds += other.kinds;
        self.kinds_denied += other.kinds_denied;
        self.patched += other.patched;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Apply every rule to the objects that already exist in the cluster.
///
/// `shutdown` is polled between iterations; once it reads true the walker
/// finishes the call it is in and returns without starting another object.
pub async fn apply_rules(client: &Client, rules: &[Rule], shutdown: &AtomicBool) -> Result<()> {
    info!("applying {} rules to existing objects", rules.len());
    let discovery = Discovery::new(client.clone()).run().await?;

    let mut total = Outcome::default();
    for rule in rules {
        if shutdown.load(Ordering::Relaxed) {
            info!("existing-object pass interrupted");
            break;
        }
        let outcome = apply_rule(client, &discovery, rule, shutdown).await;
        info!(
            "rule {}: {} patched, {} unchanged, {} skipped, {} failed across {} kinds",
            rule.name,
            outcome.patched,
            outcome.unchanged,
            outcome.skipped,
            outcome.failed,
            outcome.kinds
        );
        total.absorb(&outcome);
    }

    if total.kinds > 0 && total.kinds_denied == total.kinds {
        return Err(Error::ExistingUnauthorized);
    }
    Ok(())
}

async fn apply_rule(
    client: &Client,
    discovery: &Discovery,
    rule: &Rule,
    shutdown: &AtomicBool,
) -> Outcome {
    let mut outcome = Outcome::default();
    let mut seen: Vec<(String, String)> = Vec::new();

    for group in discovery.groups() {
        for version in group.versions() {
            for (resource, capabilities) in group.versioned_resources(&version) {
                if shutdown.load(Ordering::Relaxed) {
                    return outcome;
                }
                if !capabilities.supports_operation(verbs::LIST) {
                    continue;
                }
                if !rule
                    .registration
                    .targets
                    .iter()
                    .any(|target| selects(target, &resource))
                {
                    continue;
                }
                // the same plural can show up under several versions
                let key = (resource.group.clone(), resource.plural.clone());
                if seen.contains(&key) {
                    continue;
                }
                seen.push(key);

                outcome.kinds += 1;
                match walk_kind(client, rule, &resource, &mut outcome, shutdown).await {
                    Ok(()) => {}
                    Err(kube::Error::Api(response)) if response.code == 401 || response.code == 403 => {
                        outcome.kinds_denied += 1;
                        warn!(
                            "rule {}: not authorized to list {}, skipping the kind",
                            rule.name, resource.plural
                        );
                    }
                    Err(err) => {
                        warn!(
                            "rule {}: listing {} failed, skipping the kind ({err})",
                            rule.name, resource.plural
                        );
                    }
                }
            }
        }
    }

    if outcome.kinds == 0 {
        debug!("rule {}: no listable kinds match its targets", rule.name);
    }
    outcome
}

/// Whether a discovered resource falls under a registration target.
/// Empty target lists and `*` act as wildcards.
fn selects(target: &Target, resource: &ApiResource) -> bool {
    token_matches(&target.api_groups, &resource.group)
        && token_matches(&target.api_versions, &resource.version)
        && token_matches(&target.resources, &resource.plural)
}

fn token_matches(allowed: &[String], actual: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|token| token == "*" || token == actual)
}

async fn walk_kind(
    client: &Client,
    rule: &Rule,
    resource: &ApiResource,
    outcome: &mut Outcome,
    shutdown: &AtomicBool,
) -> Result<(), kube::Error> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), resource);
    let mut params = ListParams::default().limit(PAGE_LIMIT);

    loop {
        let page = api.list(&params).await?;
        for object in &page.items {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            paint_object(client, rule, resource, object, outcome).await;
        }
        match page.metadata.continue_ {
            Some(token) if !token.is_empty() => params.continue_token = Some(token),
            _ => break,
        }
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
    }
    Ok(())
}

async fn paint_object(
    client: &Client,
    rule: &Rule,
    resource: &ApiResource,
    object: &DynamicObject,
    outcome: &mut Outcome,
) {
    let name = object.name_any();
    let document = match serde_json::to_value(object) {
        Ok(document) => document,
        Err(err) => {
            outcome.failed += 1;
            warn!("rule {}: could not decode {}/{name} ({err})", rule.name, resource.plural);
            return;
        }
    };

    if !rule.matcher.matches(&document) {
        outcome.skipped += 1;
        return;
    }
    let Some(patch) = patch::synthesize(&document, &rule.additions) else {
        outcome.unchanged += 1;
        return;
    };

    let api: Api<DynamicObject> = match object.namespace() {
        Some(namespace) => Api::namespaced_with(client.clone(), &namespace, resource),
        None => Api::all_with(client.clone(), resource),
    };
    match api
        .patch(&name, &PatchParams::default(), &Patch::Json::<()>(patch))
        .await
    {
        Ok(_) => {
            outcome.patched += 1;
            info!("rule {}: patched {}/{name}", rule.name, resource.plural);
        }
        // a version conflict means someone else got there first; the next
        // update flows through the webhook anyway
        Err(kube::Error::Api(response)) if response.code == 409 => {
            outcome.skipped += 1;
            debug!("rule {}: version conflict on {}/{name}", rule.name, resource.plural);
        }
        Err(err) => {
            outcome.failed += 1;
            warn!("rule {}: patching {}/{name} failed ({err})", rule.name, resource.plural);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(groups: &[&str], versions: &[&str], resources: &[&str]) -> Target {
        Target {
            api_groups: groups.iter().map(|s| s.to_string()).collect(),
            api_versions: versions.iter().map(|s| s.to_string()).collect(),
            resources: resources.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn namespaces() -> ApiResource {
        ApiResource {
            group: String::new(),
            version: "v1".into(),
            api_version: "v1".into(),
            kind: "Namespace".into(),
            plural: "namespaces".into(),
        }
    }

    #[test]
    fn exact_targets_select_their_resource() {
        assert!(selects(&target(&[""], &["v1"], &["namespaces"]), &namespaces()));
        assert!(!selects(&target(&[""], &["v1"], &["pods"]), &namespaces()));
        assert!(!selects(&target(&["apps"], &["v1"], &["namespaces"]), &namespaces()));
    }

    #[test]
    fn wildcards_and_empty_lists_select_everything() {
        assert!(selects(&target(&["*"], &["*"], &["*"]), &namespaces()));
        assert!(selects(&target(&[], &[], &[]), &namespaces()));
        assert!(selects(&target(&[""], &[], &["namespaces"]), &namespaces()));
    }
}
