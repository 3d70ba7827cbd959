//! edgeplane controller
//!
//! Labels nodes with their geolocation and pins the workloads named by
//! SelectiveDeployments to the nodes inside the selected regions.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgeplane_controller::{
    config::Config,
    crd::SelectiveDeployment,
    geolookup::HttpGeoLookup,
    handlers::{inventory_trigger, release_trigger, NodeLabeler, SelectiveDeploymentHandler},
    kube_api::{watch_stream, KubeCluster},
    notify::{LogNotifier, Notifier, WebhookNotifier},
};
use edgeplane_reconcile::{Engine, EngineConfig, Handler, Store};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, CustomResourceExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// edgeplane controller - geographic placement for Kubernetes workloads.
#[derive(Debug, Parser)]
#[command(name = "edgeplane-controller")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Run the controller (default).
    Run,

    /// Print the SelectiveDeployment CustomResourceDefinition as JSON.
    Crd,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Crd => {
            println!("{}", serde_json::to_string_pretty(&SelectiveDeployment::crd())?);
            Ok(())
        }
        Command::Run => run().await,
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to EDGEPLANE_LOG_LEVEL
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting edgeplane controller");
    info!(
        geo_lookup_url = %config.geo_lookup_url,
        workers = config.workers,
        max_attempts = config.max_attempts,
        webhook = config.notify_webhook.is_some(),
        "Configuration loaded"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let cluster = Arc::new(KubeCluster::new(client.clone()));

    let lookup = Arc::new(HttpGeoLookup::new(
        config.geo_lookup_url.clone(),
        config.geo_lookup_timeout,
    )?);

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    let mut node_engine = Engine::new(
        engine_config("nodes", &config),
        Arc::new(NodeLabeler::new(lookup, cluster.clone())),
    );

    let sd_store = Store::new();
    let sd_reader = sd_store.reader();
    let sd_handler = SelectiveDeploymentHandler::new(
        node_engine.reader(),
        sd_reader.clone(),
        cluster.clone(),
        cluster.clone(),
        notifier,
    );
    let mut sd_engine = Engine::with_store(
        engine_config("selective-deployments", &config),
        sd_store,
        Arc::new(sd_handler),
    );

    // Node inventory changes re-run every SelectiveDeployment.
    node_engine.on_event(inventory_trigger(sd_reader.clone(), sd_engine.queue()));
    // A deleted owner lets the SelectiveDeployments it beat claim its workloads.
    let sd_queue = sd_engine.queue();
    sd_engine.on_event(release_trigger(sd_reader, sd_queue));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let node_handle = spawn_engine(
        node_engine,
        Api::<Node>::all(client.clone()),
        shutdown_rx.clone(),
    );
    let sd_handle = spawn_engine(
        sd_engine,
        Api::<SelectiveDeployment>::all(client),
        shutdown_rx,
    );

    shutdown_signal().await;
    info!("Received shutdown signal");

    // Signal shutdown to both engines
    let _ = shutdown_tx.send(true);

    info!("Waiting for engines to shut down...");
    if let Err(e) = tokio::time::timeout(config.shutdown_timeout, sd_handle).await {
        warn!(error = %e, "SelectiveDeployment engine did not shut down in time");
    }
    if let Err(e) = tokio::time::timeout(config.shutdown_timeout, node_handle).await {
        warn!(error = %e, "Node engine did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}

fn engine_config(name: &str, config: &Config) -> EngineConfig {
    let mut engine = EngineConfig::new(name);
    engine.workers = config.workers;
    engine.max_attempts = config.max_attempts;
    engine
}

fn spawn_engine<H: Handler>(
    engine: Engine<H>,
    api: Api<H::Object>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    H::Object: serde::de::DeserializeOwned,
{
    tokio::spawn(async move {
        if let Err(e) = engine.run(watch_stream(api), shutdown).await {
            error!(error = %e, "Engine failed");
        }
    })
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
