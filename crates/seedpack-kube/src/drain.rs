//! Removal of live extension instances before an installation goes away

use futures::future::join_all;
use kube::ResourceExt;
use std::collections::BTreeSet;
use tracing::debug;

use crate::crd::{Extension, ExtensionRegistration};
use crate::error::{ControllerError, Result};
use crate::seed::SeedClient;

/// Outcome of a drain that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No instance of the registration's types exists
    Drained,
    /// Deletion of matching instances was requested; they may still exist
    Pending(String),
}

impl DrainOutcome {
    pub fn is_drained(&self) -> bool {
        matches!(self, DrainOutcome::Drained)
    }
}

/// Extensions whose type is declared by `registration`
pub fn matching_extensions<'a>(
    registration: &ExtensionRegistration,
    extensions: &'a [Extension],
) -> Vec<&'a Extension> {
    let types: BTreeSet<&str> = registration.extension_types().collect();
    extensions
        .iter()
        .filter(|e| types.contains(e.spec.type_.as_str()))
        .collect()
}

/// Request deletion of every extension served by `registration`
///
/// Deletions run concurrently. Not-found results count as success; every
/// other failure is collected and returned as one error. When nothing failed
/// but instances existed at list time the drain is still pending, since
/// their deletion may be held by finalizers.
pub async fn drain_extensions(
    seed: &dyn SeedClient,
    registration: &ExtensionRegistration,
) -> Result<DrainOutcome> {
    let extensions = seed.list_extensions().await?;
    let matches = matching_extensions(registration, &extensions);

    if matches.is_empty() {
        return Ok(DrainOutcome::Drained);
    }

    let deletions = matches.iter().map(|extension| {
        let namespace = extension.namespace().unwrap_or_default();
        let name = extension.name_any();
        async move {
            debug!(%namespace, %name, "deleting extension");
            seed.delete_extension(&namespace, &name).await
        }
    });

    let errors: Vec<ControllerError> = join_all(deletions)
        .await
        .into_iter()
        .filter_map(|result| result.err())
        .filter(|e| !e.is_not_found())
        .collect();

    if let Some(err) = ControllerError::aggregate(errors) {
        return Err(err);
    }

    Ok(DrainOutcome::Pending(format!(
        "deletion of {} extension resource(s) is still pending",
        matches.len()
    )))
}
