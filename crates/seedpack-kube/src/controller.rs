//! Dispatching installations to the reconciler

use futures::StreamExt;
use kube::runtime::controller::{Action, Config as DispatchConfig, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ControllerConfig;
use crate::crd::ExtensionInstallation;
use crate::error::{ControllerError, Result};
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::registry::KubeRegistry;
use crate::seed::KubeSeedConnector;
use crate::writer::KubeInstallationWriter;

/// Reconciler wired to the garden and seeds through `client`
pub fn kube_reconciler(client: Client, config: ControllerConfig) -> Reconciler {
    let connector = KubeSeedConnector::new(client.clone(), config.seed_client.default_to_local);
    Reconciler::new(
        Arc::new(KubeRegistry::new(client.clone())),
        Arc::new(connector),
        Arc::new(KubeInstallationWriter::new(client)),
        config,
    )
}

/// Watch installations and reconcile them until a shutdown signal arrives
pub async fn run(client: Client, config: ControllerConfig) -> Result<()> {
    let installations: Api<ExtensionInstallation> = Api::all(client.clone());
    let concurrency = config.controller.concurrent_syncs;
    let reconciler = Arc::new(kube_reconciler(client, config));

    info!(concurrency, "starting extension installation controller");

    Controller::new(installations, watcher::Config::default())
        .with_config(DispatchConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => info!(installation = %object.name, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;

    info!("controller stopped");
    Ok(())
}

async fn reconcile(
    installation: Arc<ExtensionInstallation>,
    reconciler: Arc<Reconciler>,
) -> Result<Action> {
    let outcome = reconciler.reconcile(&installation).await?;
    log_outcome(&installation.name_any(), &outcome);
    Ok(requeue_for(&outcome, reconciler.config()))
}

fn error_policy(
    installation: Arc<ExtensionInstallation>,
    error: &ControllerError,
    reconciler: Arc<Reconciler>,
) -> Action {
    error!(
        %error,
        installation = %installation.name_any(),
        "reconciliation failed"
    );
    Action::requeue(reconciler.config().controller.error_requeue)
}

/// When to look at an installation again after a successful pass
pub fn requeue_for(outcome: &ReconcileOutcome, config: &ControllerConfig) -> Action {
    match outcome {
        ReconcileOutcome::Skipped | ReconcileOutcome::Installed => {
            Action::requeue(config.controller.sync_period)
        }
        ReconcileOutcome::DeletionPending(_) => Action::requeue(config.controller.pending_requeue),
        ReconcileOutcome::Deleted => Action::await_change(),
    }
}

fn log_outcome(name: &str, outcome: &ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Skipped => info!(installation = %name, "not responsible, skipped"),
        ReconcileOutcome::Installed => info!(installation = %name, "installation reconciled"),
        ReconcileOutcome::DeletionPending(reason) => {
            info!(installation = %name, %reason, "deletion pending")
        }
        ReconcileOutcome::Deleted => info!(installation = %name, "installation deleted"),
    }
}

/// Reconcile one installation by name
///
/// Returns `Ok(None)` when the installation no longer exists.
pub async fn reconcile_key(reconciler: &Reconciler, name: &str) -> Result<Option<ReconcileOutcome>> {
    let installation = match reconciler.registry().get_installation(name).await {
        Ok(installation) => installation,
        Err(e) if e.is_not_found() => {
            info!(installation = %name, "installation is gone, nothing to do");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let outcome = reconciler.reconcile(&installation).await?;
    log_outcome(name, &outcome);
    Ok(Some(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_requeue_intervals() {
        let config = ControllerConfig::default();

        assert_eq!(
            requeue_for(&ReconcileOutcome::Installed, &config),
            Action::requeue(Duration::from_secs(3600))
        );
        assert_eq!(
            requeue_for(&ReconcileOutcome::DeletionPending("x".into()), &config),
            Action::requeue(Duration::from_secs(10))
        );
        assert_eq!(
            requeue_for(&ReconcileOutcome::Deleted, &config),
            Action::await_change()
        );
    }
}
