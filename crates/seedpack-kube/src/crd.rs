//! Custom resources read and written by the controller
//!
//! Garden side: `ExtensionInstallation`, `ExtensionRegistration`, `Seed`.
//! Seed side: `ManagedResource` and `Extension`.

use kube::CustomResource;
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use seedpack_core::Condition;
use serde::{Deserialize, Serialize};

/// Finalizer guarding installations until the seed has been cleaned up
pub const FINALIZER: &str = "seedpack.io/extension-installation";

/// Deployment type handled by this controller
pub const DEPLOYMENT_TYPE_HELM: &str = "helm";

/// Namespace on the seed holding managed resources and their secrets
pub const GARDEN_NAMESPACE: &str = "garden";

/// Class of managed resources reconciled by the seed's resource manager
pub const MANAGED_RESOURCE_CLASS: &str = "seed";

/// Resource kind of extension instances on the seed
pub const EXTENSION_KIND: &str = "Extension";

pub const LABEL_ROLE: &str = "seedpack.io/role";
pub const ROLE_EXTENSION: &str = "extension";
pub const LABEL_REGISTRATION_NAME: &str = "seedpack.io/registration-name";

pub const TAINT_PROTECTED: &str = "seed.seedpack.io/protected";
pub const TAINT_INVISIBLE: &str = "seed.seedpack.io/invisible";

/// Reference to a cluster-scoped object by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NameRef {
    pub name: String,
}

/// Request to install an extension onto a seed
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "core.seedpack.io",
    version = "v1beta1",
    kind = "ExtensionInstallation",
    status = "ExtensionInstallationStatus",
    shortname = "extinst",
    printcolumn = r#"{"name":"Registration", "type":"string", "jsonPath":".spec.registrationRef.name"}"#,
    printcolumn = r#"{"name":"Seed", "type":"string", "jsonPath":".spec.seedRef.name"}"#,
    printcolumn = r#"{"name":"Valid", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Valid\")].status"}"#,
    printcolumn = r#"{"name":"Installed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Installed\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionInstallationSpec {
    pub registration_ref: NameRef,
    pub seed_ref: NameRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtensionInstallationStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ExtensionInstallation {
    /// Conditions currently recorded in status
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
    }
}

/// Name of the seed namespace an installation's workload runs in
pub fn extension_namespace(installation_name: &str) -> String {
    format!("extension-{}", installation_name)
}

/// Describes how to deploy an extension and which resources it serves
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "core.seedpack.io",
    version = "v1beta1",
    kind = "ExtensionRegistration",
    shortname = "extreg"
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRegistrationSpec {
    /// Extension resource kinds served on seeds
    #[serde(default)]
    pub resources: Vec<DeclaredResource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeclaredResource {
    pub kind: String,
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Deployment mechanism; only `helm` is handled here
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// Mechanism-specific payload, for `helm`: `{ chart, values }`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_config: Option<serde_json::Value>,
}

impl ExtensionRegistration {
    /// Deployment type, if any
    pub fn deployment_type(&self) -> Option<&str> {
        self.spec.deployment.as_ref()?.type_.as_deref()
    }

    /// Extension types declared with kind `Extension`
    pub fn extension_types(&self) -> impl Iterator<Item = &str> {
        self.spec
            .resources
            .iter()
            .filter(|r| r.kind == EXTENSION_KIND)
            .map(|r| r.type_.as_str())
    }
}

/// A cluster extensions are installed onto
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(group = "core.seedpack.io", version = "v1beta1", kind = "Seed")]
#[serde(rename_all = "camelCase")]
pub struct SeedSpec {
    pub provider: SeedProvider,

    #[serde(default)]
    pub dns: SeedDns,

    #[serde(default)]
    pub taints: Vec<SeedTaint>,

    #[serde(default)]
    pub networks: SeedNetworks,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<SeedVolume>,

    /// Garden secret holding a `kubeconfig` for this seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SeedProvider {
    #[serde(rename = "type")]
    pub type_: String,
    pub region: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeedDns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SeedTaint {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SeedNetworks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<String>,
    #[serde(default)]
    pub pods: String,
    #[serde(default)]
    pub services: String,
    #[serde(rename = "blockCIDRs", default)]
    pub block_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SeedVolume {
    #[serde(default)]
    pub providers: Vec<SeedVolumeProvider>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SeedVolumeProvider {
    pub purpose: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecretRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Seed {
    pub fn has_taint(&self, key: &str) -> bool {
        self.spec.taints.iter().any(|t| t.key == key)
    }
}

/// Bundle of manifests applied on the seed by its resource manager
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "resources.seedpack.io",
    version = "v1alpha1",
    kind = "ManagedResource",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceSpec {
    /// Secrets whose data entries are the manifests to apply
    pub secret_refs: Vec<LocalRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

/// Reference to an object in the same namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LocalRef {
    pub name: String,
}

/// A live extension instance on a seed
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "extensions.seedpack.io",
    version = "v1alpha1",
    kind = "Extension",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_config: Option<serde_json::Value>,
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_scopes() {
        assert_eq!(ExtensionInstallation::crd().spec.scope, "Cluster");
        assert_eq!(Seed::crd().spec.scope, "Cluster");
        assert_eq!(ManagedResource::crd().spec.scope, "Namespaced");
        assert_eq!(Extension::crd().spec.group, "extensions.seedpack.io");
    }

    #[test]
    fn test_registration_wire_format() {
        let reg: ExtensionRegistration = serde_json::from_value(serde_json::json!({
            "apiVersion": "core.seedpack.io/v1beta1",
            "kind": "ExtensionRegistration",
            "metadata": {"name": "provider-aws"},
            "spec": {
                "resources": [
                    {"kind": "Extension", "type": "shoot-dns"},
                    {"kind": "Infrastructure", "type": "aws"}
                ],
                "deployment": {"type": "helm", "providerConfig": {"chart": "H4sI", "values": {"a": 1}}}
            }
        }))
        .unwrap();

        assert_eq!(reg.deployment_type(), Some("helm"));
        assert_eq!(reg.extension_types().collect::<Vec<_>>(), vec!["shoot-dns"]);
    }

    #[test]
    fn test_seed_networks_field_names() {
        let networks: SeedNetworks = serde_json::from_value(serde_json::json!({
            "pods": "100.96.0.0/11",
            "services": "100.64.0.0/13",
            "blockCIDRs": ["169.254.169.254/32"]
        }))
        .unwrap();
        assert_eq!(networks.block_cidrs, vec!["169.254.169.254/32"]);

        let back = serde_json::to_value(&networks).unwrap();
        assert!(back.get("blockCIDRs").is_some());
        assert!(back.get("nodes").is_none());
    }

    #[test]
    fn test_finalizer_detection() {
        let mut inst = ExtensionInstallation::new(
            "a",
            ExtensionInstallationSpec {
                registration_ref: NameRef { name: "r".into() },
                seed_ref: NameRef { name: "s".into() },
            },
        );
        assert!(!inst.has_finalizer());
        inst.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        assert!(inst.has_finalizer());
        assert!(inst.conditions().is_empty());
        assert_eq!(extension_namespace("a"), "extension-a");
    }
}
