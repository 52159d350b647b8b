//! Seed cluster access
//!
//! [`SeedConnector`] turns a `Seed` descriptor into a [`SeedClient`] bound to
//! that cluster. All writes are server-side applies, so they create the
//! object when it is absent and converge it when it exists.

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use seedpack_core::KubeVersion;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::crd::{
    Extension, GARDEN_NAMESPACE, LocalRef, ManagedResource, ManagedResourceSpec, Seed,
};
use crate::error::{ControllerError, Result};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "seedpack";

/// Key of the seed secret holding the kubeconfig
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Result of deleting a managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrDeletion {
    /// The object no longer exists
    Gone,
    /// Deletion was accepted but the object still exists (finalizers pending)
    StillPresent,
}

/// Operations the reconciler performs on a seed
#[async_trait]
pub trait SeedClient: Send + Sync {
    /// API server version, exposed to templates as capabilities
    async fn server_version(&self) -> Result<KubeVersion>;

    /// Create the namespace or converge its labels
    async fn ensure_namespace(&self, name: &str, labels: &BTreeMap<String, String>)
    -> Result<()>;

    /// Create or update a secret with the given data
    async fn reconcile_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<()>;

    /// Create or update a managed resource pointing at `secret_name`
    async fn reconcile_managed_resource(
        &self,
        namespace: &str,
        name: &str,
        secret_name: &str,
        class: &str,
    ) -> Result<()>;

    /// All extension instances on the seed, across namespaces
    async fn list_extensions(&self) -> Result<Vec<Extension>>;

    async fn delete_extension(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete a managed resource; a missing object counts as gone
    async fn delete_managed_resource(&self, namespace: &str, name: &str) -> Result<MrDeletion>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_namespace(&self, name: &str) -> Result<()>;
}

/// Produces clients for seeds
#[async_trait]
pub trait SeedConnector: Send + Sync {
    async fn connect(&self, seed: &Seed) -> Result<Arc<dyn SeedClient>>;
}

/// [`SeedClient`] backed by a kube client
#[derive(Clone)]
pub struct KubeSeedClient {
    client: Client,
}

impl KubeSeedClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }
}

#[async_trait]
impl SeedClient for KubeSeedClient {
    async fn server_version(&self) -> Result<KubeVersion> {
        let info = self.client.apiserver_version().await?;
        Ok(KubeVersion::from_parts(
            &info.major,
            &info.minor,
            &info.git_version,
        ))
    }

    async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };

        api.patch(name, &Self::apply_params(), &Patch::Apply(&namespace))
            .await?;
        Ok(())
    }

    async fn reconcile_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(key, bytes)| (key, ByteString(bytes)))
                    .collect(),
            ),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        api.patch(name, &Self::apply_params(), &Patch::Apply(&secret))
            .await?;
        Ok(())
    }

    async fn reconcile_managed_resource(
        &self,
        namespace: &str,
        name: &str,
        secret_name: &str,
        class: &str,
    ) -> Result<()> {
        let api: Api<ManagedResource> = Api::namespaced(self.client.clone(), namespace);
        let mut resource = ManagedResource::new(
            name,
            ManagedResourceSpec {
                secret_refs: vec![LocalRef {
                    name: secret_name.to_string(),
                }],
                class: Some(class.to_string()),
            },
        );
        resource.metadata.namespace = Some(namespace.to_string());

        api.patch(name, &Self::apply_params(), &Patch::Apply(&resource))
            .await?;
        Ok(())
    }

    async fn list_extensions(&self) -> Result<Vec<Extension>> {
        let api: Api<Extension> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_extension(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Extension> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_managed_resource(&self, namespace: &str, name: &str) -> Result<MrDeletion> {
        let api: Api<ManagedResource> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            // The object comes back while finalizers still hold it
            Ok(outcome) => match outcome.left() {
                Some(resource) => {
                    debug!(
                        name = %resource.name_any(),
                        "managed resource is still being deleted"
                    );
                    Ok(MrDeletion::StillPresent)
                }
                None => Ok(MrDeletion::Gone),
            },
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(MrDeletion::Gone),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Connects to seeds through kubeconfigs stored in the garden
#[derive(Clone)]
pub struct KubeSeedConnector {
    garden: Client,
    default_to_local: bool,
}

impl KubeSeedConnector {
    /// `default_to_local` makes seeds without a `secretRef` use `garden`
    pub fn new(garden: Client, default_to_local: bool) -> Self {
        Self {
            garden,
            default_to_local,
        }
    }

    async fn read_kubeconfig(&self, seed: &str, name: &str, namespace: &str) -> Result<Vec<u8>> {
        let api: Api<Secret> = Api::namespaced(self.garden.clone(), namespace);
        // A missing kubeconfig secret stays a not-found error
        let secret = api.get(name).await.map_err(|e| {
            if matches!(&e, kube::Error::Api(resp) if resp.code == 404) {
                ControllerError::Api(e)
            } else {
                connection_error(seed, e)
            }
        })?;

        secret
            .data
            .and_then(|mut data| data.remove(KUBECONFIG_KEY))
            .map(|bytes| bytes.0)
            .ok_or_else(|| {
                connection_error(
                    seed,
                    format!("secret {}/{} has no '{}' key", namespace, name, KUBECONFIG_KEY),
                )
            })
    }
}

#[async_trait]
impl SeedConnector for KubeSeedConnector {
    async fn connect(&self, seed: &Seed) -> Result<Arc<dyn SeedClient>> {
        let seed_name = seed.name_any();

        let Some(secret_ref) = seed.spec.secret_ref.as_ref() else {
            if self.default_to_local {
                debug!(seed = %seed_name, "seed has no secretRef, using the local cluster");
                return Ok(Arc::new(KubeSeedClient::new(self.garden.clone())));
            }
            return Err(connection_error(&seed_name, "seed has no secretRef"));
        };

        let namespace = secret_ref.namespace.as_deref().unwrap_or(GARDEN_NAMESPACE);
        let raw = self
            .read_kubeconfig(&seed_name, &secret_ref.name, namespace)
            .await?;
        let client = client_from_kubeconfig(&raw)
            .await
            .map_err(|e| connection_error(&seed_name, e))?;

        Ok(Arc::new(KubeSeedClient::new(client)))
    }
}

/// Build a kube client from raw kubeconfig bytes
pub async fn client_from_kubeconfig(raw: &[u8]) -> std::result::Result<Client, String> {
    let text = std::str::from_utf8(raw).map_err(|e| format!("invalid kubeconfig UTF-8: {e}"))?;
    let kubeconfig =
        Kubeconfig::from_yaml(text).map_err(|e| format!("invalid kubeconfig YAML: {e}"))?;

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| format!("failed to build config: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

fn connection_error(seed: &str, message: impl ToString) -> ControllerError {
    ControllerError::SeedConnection {
        seed: seed.to_string(),
        message: message.to_string(),
    }
}
