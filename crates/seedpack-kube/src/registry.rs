//! Garden-side lookups

use async_trait::async_trait;
use kube::{Api, Client};

use crate::crd::{ExtensionInstallation, ExtensionRegistration, Seed};
use crate::error::Result;

/// Read access to the garden's objects
///
/// Every lookup returns an error classifiable with
/// [`ControllerError::is_not_found`](crate::ControllerError::is_not_found)
/// when the object does not exist.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_installation(&self, name: &str) -> Result<ExtensionInstallation>;

    async fn get_registration(&self, name: &str) -> Result<ExtensionRegistration>;

    async fn get_seed(&self, name: &str) -> Result<Seed>;
}

/// Registry reading straight from the garden API server
#[derive(Clone)]
pub struct KubeRegistry {
    client: Client,
}

impl KubeRegistry {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Registry for KubeRegistry {
    async fn get_installation(&self, name: &str) -> Result<ExtensionInstallation> {
        let api: Api<ExtensionInstallation> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn get_registration(&self, name: &str) -> Result<ExtensionRegistration> {
        let api: Api<ExtensionRegistration> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn get_seed(&self, name: &str) -> Result<Seed> {
        let api: Api<Seed> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }
}
