//! Run command - the long-running controller

use miette::{IntoDiagnostic, Result, WrapErr};
use seedpack_kube::ControllerConfig;
use std::path::Path;
use tracing::info;

pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = ControllerConfig::load(config_path)
        .into_diagnostic()
        .wrap_err("Failed to load controller configuration")?;

    let client = kube::Client::try_default()
        .await
        .into_diagnostic()
        .wrap_err("Failed to connect to the garden cluster")?;

    info!(
        garden = config.garden_identity.as_deref().unwrap_or("<unset>"),
        concurrent_syncs = config.controller.concurrent_syncs,
        default_to_local = config.seed_client.default_to_local,
        "starting extension installation controller"
    );

    seedpack_kube::run(client, config).await.into_diagnostic()?;

    info!("controller stopped");
    Ok(())
}
