//! Reconcile command - one pass over one installation

use console::style;
use miette::{IntoDiagnostic, Result, WrapErr};
use seedpack_kube::{ControllerConfig, ReconcileOutcome, kube_reconciler, reconcile_key};
use std::path::Path;

pub async fn run(name: &str, config_path: Option<&Path>) -> Result<()> {
    let config = ControllerConfig::load(config_path)
        .into_diagnostic()
        .wrap_err("Failed to load controller configuration")?;

    let client = kube::Client::try_default()
        .await
        .into_diagnostic()
        .wrap_err("Failed to connect to the garden cluster")?;

    let reconciler = kube_reconciler(client, config);
    let outcome = reconcile_key(&reconciler, name)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to reconcile installation '{}'", name))?;

    match outcome {
        None => println!("{} Installation {} no longer exists", style("•").dim(), name),
        Some(ReconcileOutcome::Skipped) => println!(
            "{} Installation {} is not deployed via helm",
            style("•").dim(),
            style(name).cyan()
        ),
        Some(ReconcileOutcome::Installed) => println!(
            "{} Installation {} reconciled",
            style("✓").green().bold(),
            style(name).cyan()
        ),
        Some(ReconcileOutcome::DeletionPending(reason)) => println!(
            "{} Installation {} deletion pending: {}",
            style("…").yellow().bold(),
            style(name).cyan(),
            reason
        ),
        Some(ReconcileOutcome::Deleted) => println!(
            "{} Installation {} deleted",
            style("✓").green().bold(),
            style(name).cyan()
        ),
    }

    Ok(())
}
