//! Liveness endpoint.
//!
//! Served on its own plain-HTTP port so the kubelet can probe the process
//! without the webhook's client-certificate requirements. The probe answers
//! 200 only while the apiserver responds to a version request.

use std::convert::Infallible;

use kube::Client;
use serde_json::json;
use tracing::warn;
use warp::http::StatusCode;
use warp::{reply, Filter, Rejection, Reply};

pub fn routes(
    client: Client,
    path: String,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let segment = path.trim_matches('/').to_owned();
    warp::get()
        .and(warp::path(segment))
        .and(warp::path::end())
        .and(warp::any().map(move || client.clone()))
        .and_then(probe_handler)
}

/// Serve the probe until the process exits.
pub async fn serve(client: Client, port: u16, path: String) {
    warp::serve(routes(client, path)).run(([0, 0, 0, 0], port)).await
}

async fn probe_handler(client: Client) -> Result<impl Reply, Infallible> {
    match client.apiserver_version().await {
        Ok(_) => Ok(reply::with_status(
            reply::json(&json!({"ok": true})),
            StatusCode::OK,
        )),
        Err(err) => {
            warn!("liveness probe failed to reach the apiserver ({err})");
            Ok(reply::with_status(
                reply::json(&json!({"ok": false})),
                StatusCode::SERVICE_UNAVAILABLE,
            ))
        }
    }
}
