use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use k8s_openapi::ByteString;
use kube::Client;
use tracing::info;

use kube_marker::{config::Configuration, existing, health, webhook, Error};

/// Automatically add labels and annotations to Kubernetes objects.
///
/// Rules match on labels and object fields; matching objects receive the
/// configured additions through a mutating webhook, and optionally through
/// a one-shot pass over the objects that already exist.
#[derive(Parser)]
#[command(name = "kube-marker", version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, env = "MARKER_CONFIG", default_value = "/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let config = Configuration::load(&args.config)?;
    init_tracing(&config.log_level);
    info!("configuration loaded from {}", args.config.display());

    let rules = config.rules()?;
    info!("compiled {} rules", rules.len());

    let client = Client::try_default().await?;

    let probe = config.health_checker.clone();
    tokio::spawn(health::serve(client.clone(), probe.port, probe.path));

    // flipped by ctrl-c; the existing-object walker polls it between
    // objects so an in-flight apiserver call is never torn down
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::Relaxed);
        }
    });

    if config.check_existing {
        existing::apply_rules(&client, &rules, &shutdown).await?;
        if shutdown.load(Ordering::Relaxed) {
            info!("interrupted during the existing-object pass");
            return Ok(());
        }
    } else {
        info!("existing-object pass is disabled");
    }

    let ca_bundle = std::fs::read(&config.server.ca_cert_path).map_err(|source| Error::Io {
        path: config.server.ca_cert_path.clone(),
        source,
    })?;

    info!("serving admission requests on port {}", config.server.port);
    tokio::spawn(webhook::serve(
        webhook::rule_set(rules.clone()),
        config.server.clone(),
    ));

    webhook::register(&client, &config.server, ByteString(ca_bundle), &rules).await?;

    if !shutdown.load(Ordering::Relaxed) {
        tokio::signal::ctrl_c().await.map_err(Error::Signal)?;
    }
    info!("shutting down");
    Ok(())
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}
