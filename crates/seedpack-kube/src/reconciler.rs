//! Install and delete state machines for extension installations
//!
//! One call to [`Reconciler::reconcile`] is one pass over one installation.
//! Passes are re-entrant: every read is repeated, every write converges, and
//! a pass that stops early is simply resumed by the next one. Both state
//! machines publish their `Valid` and `Installed` conditions on every exit
//! path, including early error returns.

use kube::ResourceExt;
use seedpack_core::conditions::get_or_init;
use seedpack_core::{Condition, ConditionStatus, ConditionType, Values, decode_blob};
use seedpack_engine::{ChartRenderer, EngineRenderer};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::crd::{
    DEPLOYMENT_TYPE_HELM, ExtensionInstallation, ExtensionRegistration, GARDEN_NAMESPACE,
    LABEL_REGISTRATION_NAME, LABEL_ROLE, MANAGED_RESOURCE_CLASS, ROLE_EXTENSION, Seed,
    extension_namespace,
};
use crate::drain::{DrainOutcome, drain_extensions};
use crate::error::{ControllerError, Result};
use crate::registry::Registry;
use crate::seed::{MrDeletion, SeedClient, SeedConnector};
use crate::seed_values::seed_values;
use crate::writer::InstallationWriter;

/// Condition reasons written by the reconciler
pub mod reason {
    pub const REGISTRATION_NOT_FOUND: &str = "RegistrationNotFound";
    pub const REGISTRATION_READ_ERROR: &str = "RegistrationReadError";
    pub const SEED_NOT_FOUND: &str = "SeedNotFound";
    pub const SEED_READ_ERROR: &str = "SeedReadError";
    pub const CHART_RENDERER_CREATION_FAILED: &str = "ChartRendererCreationFailed";
    pub const CHART_INFORMATION_INVALID: &str = "ChartInformationInvalid";
    pub const CHART_CANNOT_BE_RENDERED: &str = "ChartCannotBeRendered";
    pub const REGISTRATION_VALID: &str = "RegistrationValid";
    pub const INSTALLATION_FAILED: &str = "InstallationFailed";
    pub const INSTALLATION_PENDING: &str = "InstallationPending";
    pub const DELETION_FAILED: &str = "DeletionFailed";
    pub const DELETION_PENDING: &str = "DeletionPending";
    pub const DELETION_SUCCESSFUL: &str = "DeletionSuccessful";
}

/// Result of a pass that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The registration is not deployed by this controller
    Skipped,
    /// The rendered chart has been handed to the seed
    Installed,
    /// Teardown is waiting for resources on the seed to disappear
    DeletionPending(String),
    /// Teardown finished and the finalizer has been released
    Deleted,
}

/// `providerConfig` payload of a `helm` deployment
#[derive(Debug, Deserialize)]
struct HelmDeployment {
    /// Base64 encoded gzip tarball
    chart: String,
    #[serde(default)]
    values: serde_json::Value,
}

/// Parsed chart information of a registration
#[derive(Debug)]
pub struct ChartSource {
    pub archive: Vec<u8>,
    pub values: Values,
}

impl ChartSource {
    /// Extract the chart blob and values from a registration
    pub fn from_registration(registration: &ExtensionRegistration) -> Result<Self> {
        let raw = registration
            .spec
            .deployment
            .as_ref()
            .and_then(|d| d.provider_config.clone())
            .ok_or_else(|| ControllerError::ChartInformation("providerConfig is missing".into()))?;

        let deployment: HelmDeployment = serde_json::from_value(raw)
            .map_err(|e| ControllerError::ChartInformation(e.to_string()))?;
        let archive = decode_blob(&deployment.chart)
            .map_err(|e| ControllerError::ChartInformation(e.to_string()))?;
        let values = Values::from_mapping(deployment.values)
            .map_err(|e| ControllerError::ChartInformation(format!("values: {}", e)))?;

        Ok(Self { archive, values })
    }
}

/// The two conditions a pass maintains
#[derive(Debug, Clone)]
struct PassConditions {
    valid: Condition,
    installed: Condition,
}

impl PassConditions {
    fn from_installation(installation: &ExtensionInstallation) -> Self {
        let conditions = installation.conditions();
        Self {
            valid: get_or_init(conditions, ConditionType::Valid),
            installed: get_or_init(conditions, ConditionType::Installed),
        }
    }

    fn valid(&mut self, status: ConditionStatus, reason: &str, message: impl Into<String>) {
        self.valid = self.valid.updated(status, reason, message);
    }

    fn installed(&mut self, status: ConditionStatus, reason: &str, message: impl Into<String>) {
        self.installed = self.installed.updated(status, reason, message);
    }

    fn registration_lookup_failed(&mut self, err: &ControllerError) {
        if err.is_not_found() {
            self.valid(
                ConditionStatus::False,
                reason::REGISTRATION_NOT_FOUND,
                format!("Referenced registration does not exist: {}", err),
            );
        } else {
            self.valid(
                ConditionStatus::Unknown,
                reason::REGISTRATION_READ_ERROR,
                format!("Referenced registration cannot be read: {}", err),
            );
        }
    }

    fn seed_lookup_failed(&mut self, err: &ControllerError) {
        if err.is_not_found() {
            self.valid(
                ConditionStatus::False,
                reason::SEED_NOT_FOUND,
                format!("Referenced seed does not exist: {}", err),
            );
        } else {
            self.valid(
                ConditionStatus::Unknown,
                reason::SEED_READ_ERROR,
                format!("Referenced seed cannot be read: {}", err),
            );
        }
    }

    fn seed_connection_failed(&mut self, err: &ControllerError) {
        if err.is_not_found() {
            self.valid(
                ConditionStatus::False,
                reason::SEED_NOT_FOUND,
                format!("Referenced seed has no reachable cluster: {}", err),
            );
        } else {
            self.valid(
                ConditionStatus::Unknown,
                reason::SEED_READ_ERROR,
                format!("Referenced seed cannot be reached: {}", err),
            );
        }
    }

    fn to_vec(&self) -> Vec<Condition> {
        vec![self.valid.clone(), self.installed.clone()]
    }
}

/// Reconciles extension installations against their seeds
pub struct Reconciler {
    registry: Arc<dyn Registry>,
    connector: Arc<dyn SeedConnector>,
    writer: Arc<dyn InstallationWriter>,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn Registry>,
        connector: Arc<dyn SeedConnector>,
        writer: Arc<dyn InstallationWriter>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            writer,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &dyn Registry {
        self.registry.as_ref()
    }

    /// Whether the installation's registration is deployed by this controller
    ///
    /// Lookup errors, not-found included, are returned as errors.
    pub async fn is_responsible(&self, installation: &ExtensionInstallation) -> Result<bool> {
        let registration = self
            .registry
            .get_registration(&installation.spec.registration_ref.name)
            .await?;
        Ok(registration.deployment_type() == Some(DEPLOYMENT_TYPE_HELM))
    }

    /// Run one pass over `installation`
    pub async fn reconcile(&self, installation: &ExtensionInstallation) -> Result<ReconcileOutcome> {
        if !self.is_responsible(installation).await? {
            debug!(
                installation = %installation.name_any(),
                "registration is not deployed via helm, skipping"
            );
            return Ok(ReconcileOutcome::Skipped);
        }

        if installation.is_being_deleted() {
            self.delete(installation).await
        } else {
            self.install(installation).await
        }
    }

    /// Install state machine, without the responsibility check
    pub async fn install(&self, installation: &ExtensionInstallation) -> Result<ReconcileOutcome> {
        let name = installation.name_any();
        self.writer.ensure_finalizer(&name).await?;

        let mut conditions = PassConditions::from_installation(installation);
        let result = self.install_inner(installation, &mut conditions).await;

        if let Err(e) = self.writer.update_conditions(&name, &conditions.to_vec()).await {
            warn!(installation = %name, error = %e, "failed to update the conditions");
        }

        result.map(|()| ReconcileOutcome::Installed)
    }

    async fn install_inner(
        &self,
        installation: &ExtensionInstallation,
        conditions: &mut PassConditions,
    ) -> Result<()> {
        let name = installation.name_any();

        let registration = self
            .registry
            .get_registration(&installation.spec.registration_ref.name)
            .await
            .inspect_err(|e| conditions.registration_lookup_failed(e))?;
        let registration_name = registration.name_any();

        let seed = self
            .registry
            .get_seed(&installation.spec.seed_ref.name)
            .await
            .inspect_err(|e| conditions.seed_lookup_failed(e))?;

        let (client, renderer) = self.connect(&seed).await.inspect_err(|e| {
            conditions.valid(
                ConditionStatus::Unknown,
                reason::CHART_RENDERER_CREATION_FAILED,
                format!("Chart renderer cannot be created for the referenced seed: {}", e),
            )
        })?;

        let source = ChartSource::from_registration(&registration).inspect_err(|e| {
            conditions.valid(
                ConditionStatus::False,
                reason::CHART_INFORMATION_INVALID,
                format!("Chart information cannot be read: {}", e),
            )
        })?;

        let namespace = extension_namespace(&name);
        let labels = BTreeMap::from([
            (LABEL_ROLE.to_string(), ROLE_EXTENSION.to_string()),
            (LABEL_REGISTRATION_NAME.to_string(), registration_name.clone()),
        ]);
        client.ensure_namespace(&namespace, &labels).await?;

        let values = self.chart_values(&seed, &registration_name, &source.values)?;

        let secret_data = renderer
            .render_archive(&source.archive, &registration_name, &namespace, &values)
            .and_then(|rendered| rendered.as_secret_data())
            .inspect_err(|e| {
                conditions.valid(
                    ConditionStatus::False,
                    reason::CHART_CANNOT_BE_RENDERED,
                    format!("Chart rendering failed: {}", e),
                )
            })?;
        conditions.valid(
            ConditionStatus::True,
            reason::REGISTRATION_VALID,
            "Chart could be rendered successfully.",
        );

        client
            .reconcile_secret(GARDEN_NAMESPACE, &name, secret_data)
            .await
            .inspect_err(|e| {
                conditions.installed(
                    ConditionStatus::False,
                    reason::INSTALLATION_FAILED,
                    format!("Creation of managed resource secret '{}' failed: {}", name, e),
                )
            })?;

        client
            .reconcile_managed_resource(GARDEN_NAMESPACE, &name, &name, MANAGED_RESOURCE_CLASS)
            .await
            .inspect_err(|e| {
                conditions.installed(
                    ConditionStatus::False,
                    reason::INSTALLATION_FAILED,
                    format!("Creation of managed resource '{}' failed: {}", name, e),
                )
            })?;

        // Health of the managed resource is reported elsewhere; only the
        // first pass marks the installation as pending.
        if conditions.installed.status == ConditionStatus::Unknown {
            conditions.installed(
                ConditionStatus::False,
                reason::INSTALLATION_PENDING,
                format!("Installation of managed resource '{}' is still pending.", name),
            );
        }

        Ok(())
    }

    /// Connect to the seed and build a renderer for its API server version
    async fn connect(&self, seed: &Seed) -> Result<(Arc<dyn SeedClient>, Box<dyn ChartRenderer>)> {
        let client = self.connector.connect(seed).await?;
        let version = client.server_version().await?;
        Ok((client, Box::new(EngineRenderer::for_version(version))))
    }

    fn chart_values(
        &self,
        seed: &Seed,
        registration_name: &str,
        registration_values: &Values,
    ) -> Result<Values> {
        let base = seed_values(seed, self.config.garden_identity.as_deref())?;
        Ok(overlay_values(
            base,
            &self.config,
            registration_name,
            registration_values,
        ))
    }

    /// Delete state machine, without the responsibility check
    pub async fn delete(&self, installation: &ExtensionInstallation) -> Result<ReconcileOutcome> {
        let name = installation.name_any();

        let mut conditions = PassConditions::from_installation(installation);
        let result = self.delete_inner(installation, &mut conditions).await;

        match self.writer.update_conditions(&name, &conditions.to_vec()).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(installation = %name, "installation is gone, conditions not published");
            }
            Err(e) => {
                warn!(installation = %name, error = %e, "failed to update the conditions during deletion");
            }
        }

        result
    }

    async fn delete_inner(
        &self,
        installation: &ExtensionInstallation,
        conditions: &mut PassConditions,
    ) -> Result<ReconcileOutcome> {
        let name = installation.name_any();

        let seed = self
            .registry
            .get_seed(&installation.spec.seed_ref.name)
            .await
            .inspect_err(|e| conditions.seed_lookup_failed(e))?;

        let registration = self
            .registry
            .get_registration(&installation.spec.registration_ref.name)
            .await
            .inspect_err(|e| conditions.registration_lookup_failed(e))?;

        let client = self
            .connector
            .connect(&seed)
            .await
            .inspect_err(|e| conditions.seed_connection_failed(e))?;

        match drain_extensions(client.as_ref(), &registration).await {
            Ok(DrainOutcome::Drained) => {}
            Ok(DrainOutcome::Pending(message)) => {
                info!(installation = %name, "{}", message);
                conditions.installed(ConditionStatus::False, reason::DELETION_PENDING, &message);
                return Ok(ReconcileOutcome::DeletionPending(message));
            }
            Err(e) => {
                conditions.installed(
                    ConditionStatus::False,
                    reason::DELETION_FAILED,
                    format!("Deletion of extension resources failed: {}", e),
                );
                return Err(e);
            }
        }

        match client.delete_managed_resource(GARDEN_NAMESPACE, &name).await {
            Ok(MrDeletion::Gone) => {}
            Ok(MrDeletion::StillPresent) => {
                let message = format!("Deletion of managed resource '{}' is still pending.", name);
                info!(installation = %name, "{}", message);
                conditions.installed(ConditionStatus::False, reason::DELETION_PENDING, &message);
                return Ok(ReconcileOutcome::DeletionPending(message));
            }
            Err(e) => {
                conditions.installed(
                    ConditionStatus::False,
                    reason::DELETION_FAILED,
                    format!("Deletion of managed resource '{}' failed: {}", name, e),
                );
                return Err(e);
            }
        }

        let secret_result = match client.delete_secret(GARDEN_NAMESPACE, &name).await {
            Err(e) if !e.is_not_found() => {
                warn!(installation = %name, error = %e, "failed to delete managed resource secret");
                conditions.installed(
                    ConditionStatus::False,
                    reason::DELETION_FAILED,
                    format!("Deletion of managed resource secret '{}' failed: {}", name, e),
                );
                Err(e)
            }
            _ => Ok(()),
        };

        // The namespace is still attempted; the finalizer waits for both
        if let Err(e) = client.delete_namespace(&extension_namespace(&name)).await
            && !e.is_not_found()
        {
            return Err(secret_result.err().unwrap_or(e));
        }
        secret_result?;

        conditions.installed(
            ConditionStatus::False,
            reason::DELETION_SUCCESSFUL,
            "Deletion of old resources succeeded.",
        );
        self.writer.remove_finalizer(&name).await?;

        Ok(ReconcileOutcome::Deleted)
    }
}

/// Overlay configured overrides, then the registration's values, on `base`
///
/// An unusable override entry is logged and skipped.
pub fn overlay_values(
    mut base: Values,
    config: &ControllerConfig,
    registration_name: &str,
    registration_values: &Values,
) -> Values {
    match config.override_values_for(registration_name) {
        Ok(Some(overrides)) => base.merge(&overrides),
        Ok(None) => {}
        Err(e) => {
            warn!(registration = %registration_name, error = %e, "ignoring override values");
        }
    }

    base.merge(registration_values);
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DeploymentSpec, ExtensionRegistrationSpec};
    use serde_json::json;

    fn registration(provider_config: Option<serde_json::Value>) -> ExtensionRegistration {
        ExtensionRegistration::new(
            "provider-local",
            ExtensionRegistrationSpec {
                resources: vec![],
                deployment: Some(DeploymentSpec {
                    type_: Some("helm".into()),
                    provider_config,
                }),
            },
        )
    }

    #[test]
    fn test_chart_source_parsing() {
        let source = ChartSource::from_registration(&registration(Some(json!({
            "chart": "aGVsbG8=",
            "values": {"replicas": 3}
        }))))
        .unwrap();
        assert_eq!(source.archive, b"hello");
        assert_eq!(source.values.get("replicas").unwrap(), 3);

        let source =
            ChartSource::from_registration(&registration(Some(json!({"chart": "aGVsbG8="}))))
                .unwrap();
        assert!(source.values.is_empty());
    }

    #[test]
    fn test_chart_source_rejects_malformed_config() {
        let cases = [
            None,
            Some(json!("just a string")),
            Some(json!({"values": {}})),
            Some(json!({"chart": "%%% not base64 %%%"})),
            Some(json!({"chart": "aGVsbG8=", "values": [1, 2]})),
        ];

        for config in cases {
            let err = ChartSource::from_registration(&registration(config)).unwrap_err();
            assert!(matches!(err, ControllerError::ChartInformation(_)), "{err}");
        }
    }

    #[test]
    fn test_overlay_precedence() {
        let config = ControllerConfig::from_yaml(
            "overrideValues:\n  r1:\n    image: {tag: override, pullPolicy: Always}\n    replicas: 2\n",
        )
        .unwrap();
        let base = Values::from_yaml("image: {repository: seed, tag: seed}\nreplicas: 1\n").unwrap();
        let registration = Values::from_yaml("image: {tag: registration}").unwrap();

        let values = overlay_values(base.clone(), &config, "r1", &registration);
        assert_eq!(values.get("image.repository").unwrap(), "seed");
        assert_eq!(values.get("image.tag").unwrap(), "registration");
        assert_eq!(values.get("image.pullPolicy").unwrap(), "Always");
        assert_eq!(values.get("replicas").unwrap(), 2);

        // No override configured for this registration
        let values = overlay_values(base, &config, "r2", &registration);
        assert_eq!(values.get("replicas").unwrap(), 1);
        assert!(values.get("image.pullPolicy").is_none());
    }

    #[test]
    fn test_lookup_failure_mapping() {
        let inst = ExtensionInstallation::new(
            "a",
            crate::crd::ExtensionInstallationSpec {
                registration_ref: crate::crd::NameRef { name: "r".into() },
                seed_ref: crate::crd::NameRef { name: "s".into() },
            },
        );

        let mut conditions = PassConditions::from_installation(&inst);
        conditions.seed_lookup_failed(&crate::error::not_found("Seed", "s"));
        assert_eq!(conditions.valid.status, ConditionStatus::False);
        assert_eq!(conditions.valid.reason, reason::SEED_NOT_FOUND);

        conditions.registration_lookup_failed(&crate::error::api_error(500, "InternalError", "boom"));
        assert_eq!(conditions.valid.status, ConditionStatus::Unknown);
        assert_eq!(conditions.valid.reason, reason::REGISTRATION_READ_ERROR);
        assert_eq!(conditions.installed.reason, seedpack_core::conditions::REASON_INITIALIZED);
    }
}
