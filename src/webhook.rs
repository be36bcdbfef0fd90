//! Admission multiplexer and webhook registration.
//!
//! Every rule is served on its own path (`/mutate/<rule-name>`) and
//! registered with the apiserver as its own `MutatingWebhookConfiguration`,
//! so each rule carries its own target-resource filter and failure policy.
//! Unknown paths are a plain 404; the route table is built once at startup
//! and shared read-only across request handlers.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{info, warn};
use warp::hyper::body::Bytes;
use warp::{reply, Filter, Rejection, Reply};

use crate::config::Server;
use crate::error::Result;
use crate::rule::Rule;

/// Read-only dispatch table from rule name to rule.
pub type RuleSet = Arc<HashMap<String, Rule>>;

pub fn rule_set(rules: Vec<Rule>) -> RuleSet {
    Arc::new(rules.into_iter().map(|r| (r.name.clone(), r)).collect())
}

/// The webhook routes: POST `/mutate/<rule-name>`.
pub fn routes(rules: RuleSet) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("mutate" / String)
        .and(warp::post())
        .and(warp::body::bytes())
        .and(warp::any().map(move || rules.clone()))
        .and_then(mutate_handler)
        .with(warp::trace::request())
}

/// Serve the routes over TLS until the process exits.
pub async fn serve(rules: RuleSet, server: Server) {
    warp::serve(routes(rules))
        .tls()
        .cert_path(&server.cert_path)
        .key_path(&server.key_path)
        .run(([0, 0, 0, 0], server.port))
        .await
}

async fn mutate_handler(
    name: String,
    body: Bytes,
    rules: RuleSet,
) -> Result<impl Reply, Rejection> {
    let Some(rule) = rules.get(&name) else {
        return Err(warp::reject::not_found());
    };

    // A mutator never blocks traffic: a body that is not a well-formed
    // admission review is allowed through untouched.
    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(err) => {
            warn!("rule {name}: not an admission review, allowing unchanged ({err})");
            return Ok(reply::json(&permissive_review(&salvage_uid(&body))));
        }
    };
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(err) => {
            warn!("rule {name}: review carries no request, allowing unchanged ({err})");
            return Ok(reply::json(&permissive_review(&salvage_uid(&body))));
        }
    };

    let mut res = AdmissionResponse::from(&req);
    if let Some(obj) = &req.object {
        let object_name = obj.name_any();
        match serde_json::to_value(obj) {
            Ok(document) => {
                if let Some(patch) = rule.evaluate(&document) {
                    let count = patch.0.len();
                    res = match res.with_patch(patch) {
                        Ok(patched) => {
                            info!(
                                "rule {name}: {:?} on {object_name}, {count} patch ops",
                                req.operation
                            );
                            patched
                        }
                        Err(err) => {
                            warn!("rule {name}: could not serialize patch for {object_name}, allowing unchanged ({err})");
                            AdmissionResponse::from(&req)
                        }
                    };
                }
            }
            Err(err) => {
                warn!("rule {name}: could not decode {object_name}, allowing unchanged ({err})");
            }
        }
    }
    Ok(reply::json(&res.into_review()))
}

/// Allow-through envelope for bodies the admission types cannot decode.
fn permissive_review(uid: &str) -> serde_json::Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": true
        }
    })
}

/// Best-effort UID echo from a malformed body.
fn salvage_uid(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.pointer("/request/uid").and_then(|u| u.as_str().map(String::from)))
        .unwrap_or_default()
}

/// Register every rule with the apiserver as a mutating webhook.
///
/// Uses server-side apply so restarts converge on the same configuration.
pub async fn register(
    client: &Client,
    server: &Server,
    ca_bundle: ByteString,
    rules: &[Rule],
) -> Result<()> {
    let api: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let params = PatchParams::apply(env!("CARGO_PKG_NAME")).force();
    for rule in rules {
        let configuration = webhook_configuration(rule, server, &ca_bundle);
        let name = format!("{}.{}", rule.name, server.company_domain);
        info!("registering mutating webhook {name}");
        // server-side apply needs the type meta spelled out
        let mut document = serde_json::to_value(&configuration)?;
        document["apiVersion"] =
            json!(<MutatingWebhookConfiguration as k8s_openapi::Resource>::API_VERSION);
        document["kind"] = json!(<MutatingWebhookConfiguration as k8s_openapi::Resource>::KIND);
        api.patch(&name, &params, &Patch::Apply(&document)).await?;
    }
    Ok(())
}

fn webhook_configuration(
    rule: &Rule,
    server: &Server,
    ca_bundle: &ByteString,
) -> MutatingWebhookConfiguration {
    let name = format!("{}.{}", rule.name, server.company_domain);
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name,
            admission_review_versions: vec!["v1".to_owned()],
            side_effects: "None".to_owned(),
            client_config: WebhookClientConfig {
                ca_bundle: Some(ca_bundle.clone()),
                service: Some(ServiceReference {
                    namespace: server.namespace.clone(),
                    name: server.service.clone(),
                    path: Some(format!("/mutate/{}", rule.name)),
                    port: Some(i32::from(server.port)),
                }),
                url: None,
            },
            failure_policy: Some(rule.registration.failure_policy.as_str().to_owned()),
            namespace_selector: rule.registration.namespace_selector.clone(),
            rules: Some(
                rule.registration
                    .targets
                    .iter()
                    .map(|target| RuleWithOperations {
                        api_groups: Some(target.api_groups.clone()),
                        api_versions: Some(target.api_versions.clone()),
                        resources: Some(target.resources.clone()),
                        operations: Some(vec!["CREATE".to_owned(), "UPDATE".to_owned()]),
                        scope: Some("*".to_owned()),
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}
