//! Writes to the installation object: finalizer and status conditions

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use seedpack_core::{Condition, merge_conditions};
use serde_json::json;
use tracing::debug;

use crate::crd::{ExtensionInstallation, FINALIZER};
use crate::error::Result;

/// Attempts made when a write hits a stale resource version
const WRITE_ATTEMPTS: usize = 5;

/// Mutations the reconciler makes to the installation itself
#[async_trait]
pub trait InstallationWriter: Send + Sync {
    /// Add the finalizer if it is missing
    async fn ensure_finalizer(&self, name: &str) -> Result<()>;

    /// Remove the finalizer if present
    async fn remove_finalizer(&self, name: &str) -> Result<()>;

    /// Merge `conditions` into the stored status and persist the result
    ///
    /// Returns `false` without writing when the merge changes nothing.
    async fn update_conditions(&self, name: &str, conditions: &[Condition]) -> Result<bool>;
}

/// Finalizer list with ours added, or `None` when already present
fn with_finalizer(installation: &ExtensionInstallation) -> Option<Vec<String>> {
    if installation.has_finalizer() {
        return None;
    }
    let mut finalizers = installation.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    Some(finalizers)
}

/// Finalizer list with ours removed, or `None` when absent
fn without_finalizer(installation: &ExtensionInstallation) -> Option<Vec<String>> {
    if !installation.has_finalizer() {
        return None;
    }
    Some(
        installation
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect(),
    )
}

/// Merge patch replacing the finalizer list of the version that was read
///
/// The resource version makes the patch fail with 409 on a stale read, so
/// finalizers owned by others are never overwritten.
fn finalizer_patch(
    installation: &ExtensionInstallation,
    finalizers: &[String],
) -> serde_json::Value {
    json!({
        "metadata": {
            "resourceVersion": installation.resource_version(),
            "finalizers": finalizers
        }
    })
}

fn is_retryable_conflict(err: &kube::Error, attempt: usize) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409) && attempt < WRITE_ATTEMPTS
}

/// [`InstallationWriter`] patching the garden API server
#[derive(Clone)]
pub struct KubeInstallationWriter {
    api: Api<ExtensionInstallation>,
}

impl KubeInstallationWriter {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    async fn edit_finalizers(
        &self,
        name: &str,
        edit: fn(&ExtensionInstallation) -> Option<Vec<String>>,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            let installation = self.api.get(name).await?;
            let Some(finalizers) = edit(&installation) else {
                return Ok(());
            };

            let patch = finalizer_patch(&installation, &finalizers);
            match self
                .api
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if is_retryable_conflict(&e, attempt) => {
                    debug!(installation = %name, attempt, "finalizer write conflicted, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl InstallationWriter for KubeInstallationWriter {
    async fn ensure_finalizer(&self, name: &str) -> Result<()> {
        self.edit_finalizers(name, with_finalizer).await
    }

    async fn remove_finalizer(&self, name: &str) -> Result<()> {
        self.edit_finalizers(name, without_finalizer).await
    }

    async fn update_conditions(&self, name: &str, conditions: &[Condition]) -> Result<bool> {
        let mut attempt = 1;
        loop {
            let installation = self.api.get(name).await?;
            let current = installation.conditions();
            let merged = merge_conditions(current, conditions);
            if merged == current {
                debug!(installation = %name, "conditions unchanged, skipping status write");
                return Ok(false);
            }

            // The resource version makes the patch fail with 409 on a stale read
            let patch = json!({
                "metadata": {
                    "resourceVersion": installation.resource_version()
                },
                "status": {
                    "conditions": merged
                }
            });

            match self
                .api
                .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => return Ok(true),
                Err(e) if is_retryable_conflict(&e, attempt) => {
                    debug!(installation = %name, attempt, "status write conflicted, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
