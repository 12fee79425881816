//! Warden Operator - installs Warden security sensors and keeps them current

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;

use warden_common::store::KubeStore;
use warden_common::telemetry::init_telemetry;
use warden_operator::catalog::HttpCatalog;
use warden_operator::config::{Cli, Command};
use warden_operator::controllers::{admission_controller, node_controller, Shared};
use warden_operator::crds;
use warden_tracker::spawn_tracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.command == Some(Command::Crd) {
        println!("{}", crds::to_yaml()?);
        return Ok(());
    }

    init_telemetry(cli.telemetry_config())?;
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let catalog_url = cli
        .catalog_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--catalog-url (or WARDEN_CATALOG_URL) is required"))?;
    let bearer = match &cli.catalog_token_file {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?,
        ),
        None => None,
    };

    let client = Client::try_default().await?;
    crds::ensure_installed(&client).await?;

    let cancel = CancellationToken::new();
    let (tracker, tracker_task) = spawn_tracker(cli.tracker_config(), cancel.clone());

    let shared = Shared {
        client: client.clone(),
        store: Arc::new(KubeStore::new(client)),
        catalog: Arc::new(HttpCatalog::new(&catalog_url, bearer)?),
        tracker,
        settings: cli.settings(),
        concurrency: cli.concurrency,
    };

    tracing::info!(catalog = %catalog_url, registry = %shared.settings.registry, "starting controllers");
    futures::future::join_all([node_controller(&shared), admission_controller(&shared)]).await;

    tracing::info!("controllers stopped, shutting down version tracker");
    cancel.cancel();
    if let Err(e) = tracker_task.await {
        tracing::warn!(error = %e, "version tracker task ended abnormally");
    }
    Ok(())
}
