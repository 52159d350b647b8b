//! In-memory garden and seed for testing
//!
//! These collaborators keep their objects in memory, count the operations
//! performed on them and fail on demand with the same API error responses a
//! real server returns, so callers classify their failures identically.

use async_trait::async_trait;
use kube::ResourceExt;
use seedpack_core::{Condition, KubeVersion, merge_conditions};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::crd::{
    Extension, ExtensionInstallation, ExtensionInstallationStatus, ExtensionRegistration,
    FINALIZER, LocalRef, ManagedResource, ManagedResourceSpec, Seed,
};
use crate::error::{ControllerError, Result, api_error, not_found};
use crate::registry::Registry;
use crate::seed::{MrDeletion, SeedClient, SeedConnector};
use crate::writer::InstallationWriter;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn failure(code: u16, what: &str) -> ControllerError {
    let reason = match code {
        404 => "NotFound",
        409 => "Conflict",
        403 => "Forbidden",
        _ => "InternalError",
    };
    api_error(code, reason, format!("injected failure: {}", what))
}

#[derive(Default)]
struct GardenState {
    installations: BTreeMap<String, ExtensionInstallation>,
    registrations: BTreeMap<String, ExtensionRegistration>,
    seeds: BTreeMap<String, Seed>,
    registration_read_failure: Option<u16>,
    seed_read_failure: Option<u16>,
    status_write_failure: Option<u16>,
    resource_version: u64,
}

impl GardenState {
    fn bump(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// Counts of garden writes for assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GardenCounts {
    pub finalizer_adds: usize,
    pub finalizer_removals: usize,
    pub status_writes: usize,
    pub skipped_status_writes: usize,
}

/// In-memory garden registry
#[derive(Clone, Default)]
pub struct MockRegistry {
    state: Arc<RwLock<GardenState>>,
    counts: Arc<RwLock<GardenCounts>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_installation(&self, mut installation: ExtensionInstallation) {
        let mut state = write(&self.state);
        installation.metadata.resource_version = Some(state.bump());
        state
            .installations
            .insert(installation.name_any(), installation);
    }

    pub fn add_registration(&self, registration: ExtensionRegistration) {
        write(&self.state)
            .registrations
            .insert(registration.name_any(), registration);
    }

    pub fn add_seed(&self, seed: Seed) {
        write(&self.state).seeds.insert(seed.name_any(), seed);
    }

    pub fn remove_registration(&self, name: &str) {
        write(&self.state).registrations.remove(name);
    }

    pub fn remove_seed(&self, name: &str) {
        write(&self.state).seeds.remove(name);
    }

    /// Mark an installation for deletion, as the API server does on DELETE
    /// for an object holding finalizers
    pub fn mark_for_deletion(&self, name: &str) {
        let mut state = write(&self.state);
        let rv = state.bump();
        if let Some(installation) = state.installations.get_mut(name) {
            if installation.finalizers().is_empty() {
                state.installations.remove(name);
                return;
            }
            installation.metadata.deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
            );
            installation.metadata.resource_version = Some(rv);
        }
    }

    /// Current state of an installation
    pub fn installation(&self, name: &str) -> Option<ExtensionInstallation> {
        read(&self.state).installations.get(name).cloned()
    }

    /// Fail registration reads with the given status code
    pub fn fail_registration_reads(&self, code: Option<u16>) {
        write(&self.state).registration_read_failure = code;
    }

    /// Fail seed reads with the given status code
    pub fn fail_seed_reads(&self, code: Option<u16>) {
        write(&self.state).seed_read_failure = code;
    }

    pub fn counts(&self) -> GardenCounts {
        read(&self.counts).clone()
    }

    pub fn reset_counts(&self) {
        *write(&self.counts) = GardenCounts::default();
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn get_installation(&self, name: &str) -> Result<ExtensionInstallation> {
        read(&self.state)
            .installations
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("ExtensionInstallation", name))
    }

    async fn get_registration(&self, name: &str) -> Result<ExtensionRegistration> {
        let state = read(&self.state);
        if let Some(code) = state.registration_read_failure {
            return Err(failure(code, "registration read"));
        }
        state
            .registrations
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("ExtensionRegistration", name))
    }

    async fn get_seed(&self, name: &str) -> Result<Seed> {
        let state = read(&self.state);
        if let Some(code) = state.seed_read_failure {
            return Err(failure(code, "seed read"));
        }
        state
            .seeds
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("Seed", name))
    }
}

/// Writes into a [`MockRegistry`]'s installations
#[derive(Clone)]
pub struct MockInstallationWriter {
    registry: MockRegistry,
}

impl MockInstallationWriter {
    pub fn new(registry: &MockRegistry) -> Self {
        Self {
            registry: registry.clone(),
        }
    }

    /// Fail status writes with the given status code
    pub fn fail_status_writes(&self, code: Option<u16>) {
        write(&self.registry.state).status_write_failure = code;
    }

    fn count(&self, f: impl FnOnce(&mut GardenCounts)) {
        f(&mut write(&self.registry.counts));
    }
}

#[async_trait]
impl InstallationWriter for MockInstallationWriter {
    async fn ensure_finalizer(&self, name: &str) -> Result<()> {
        let mut state = write(&self.registry.state);
        let rv = state.bump();
        let installation = state
            .installations
            .get_mut(name)
            .ok_or_else(|| not_found("ExtensionInstallation", name))?;

        if installation.has_finalizer() {
            return Ok(());
        }
        installation.finalizers_mut().push(FINALIZER.to_string());
        installation.metadata.resource_version = Some(rv);
        drop(state);

        self.count(|c| c.finalizer_adds += 1);
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str) -> Result<()> {
        let mut state = write(&self.registry.state);
        let rv = state.bump();
        let installation = state
            .installations
            .get_mut(name)
            .ok_or_else(|| not_found("ExtensionInstallation", name))?;

        if !installation.has_finalizer() {
            return Ok(());
        }
        installation.finalizers_mut().retain(|f| f != FINALIZER);
        installation.metadata.resource_version = Some(rv);

        // The API server removes a deleted object once its last finalizer goes
        if installation.is_being_deleted() && installation.finalizers().is_empty() {
            state.installations.remove(name);
        }
        drop(state);

        self.count(|c| c.finalizer_removals += 1);
        Ok(())
    }

    async fn update_conditions(&self, name: &str, conditions: &[Condition]) -> Result<bool> {
        let mut state = write(&self.registry.state);
        if let Some(code) = state.status_write_failure {
            return Err(failure(code, "status write"));
        }
        let rv = state.bump();
        let installation = state
            .installations
            .get_mut(name)
            .ok_or_else(|| not_found("ExtensionInstallation", name))?;

        let current = installation.conditions();
        let merged = merge_conditions(current, conditions);
        if merged == current {
            drop(state);
            self.count(|c| c.skipped_status_writes += 1);
            return Ok(false);
        }

        installation.status = Some(ExtensionInstallationStatus { conditions: merged });
        installation.metadata.resource_version = Some(rv);
        drop(state);

        self.count(|c| c.status_writes += 1);
        Ok(true)
    }
}

/// Seed operations a [`MockSeed`] can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeedOp {
    Connect,
    ServerVersion,
    EnsureNamespace,
    ReconcileSecret,
    ReconcileManagedResource,
    ListExtensions,
    DeleteManagedResource,
    DeleteSecret,
    DeleteNamespace,
}

/// Counts of seed operations for assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedCounts {
    pub connects: usize,
    pub namespace_applies: usize,
    pub secret_applies: usize,
    pub managed_resource_applies: usize,
    pub extension_lists: usize,
    pub extension_deletes: usize,
    pub managed_resource_deletes: usize,
    pub secret_deletes: usize,
    pub namespace_deletes: usize,
}

#[derive(Default)]
struct SeedState {
    version: KubeVersion,
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
    secrets: BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>,
    managed_resources: BTreeMap<(String, String), ManagedResource>,
    extensions: BTreeMap<(String, String), Extension>,
    /// Extension deletions are accepted but the objects stay (finalizers)
    hold_extensions: bool,
    /// Managed resource deletions are accepted but the objects stay
    hold_managed_resources: bool,
    failures: HashMap<SeedOp, u16>,
    extension_delete_failures: HashMap<String, u16>,
}

/// In-memory seed cluster, acting as its own connector
#[derive(Clone, Default)]
pub struct MockSeed {
    state: Arc<RwLock<SeedState>>,
    counts: Arc<RwLock<SeedCounts>>,
}

impl MockSeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(version: KubeVersion) -> Self {
        let seed = Self::new();
        write(&seed.state).version = version;
        seed
    }

    pub fn add_extension(&self, mut extension: Extension, namespace: &str) {
        extension.metadata.namespace = Some(namespace.to_string());
        write(&self.state)
            .extensions
            .insert((namespace.to_string(), extension.name_any()), extension);
    }

    pub fn add_managed_resource(&self, namespace: &str, name: &str) {
        let mut resource = ManagedResource::new(
            name,
            ManagedResourceSpec {
                secret_refs: vec![LocalRef {
                    name: name.to_string(),
                }],
                class: None,
            },
        );
        resource.metadata.namespace = Some(namespace.to_string());
        write(&self.state)
            .managed_resources
            .insert((namespace.to_string(), name.to_string()), resource);
    }

    /// Keep extensions after their deletion was requested
    pub fn hold_extensions(&self, hold: bool) {
        write(&self.state).hold_extensions = hold;
    }

    /// Keep managed resources after their deletion was requested
    pub fn hold_managed_resources(&self, hold: bool) {
        write(&self.state).hold_managed_resources = hold;
    }

    /// Fail `op` with the given status code
    pub fn fail(&self, op: SeedOp, code: u16) {
        write(&self.state).failures.insert(op, code);
    }

    /// Stop failing `op`
    pub fn heal(&self, op: SeedOp) {
        write(&self.state).failures.remove(&op);
    }

    /// Fail the deletion of one extension with the given status code
    pub fn fail_extension_delete(&self, name: &str, code: u16) {
        write(&self.state)
            .extension_delete_failures
            .insert(name.to_string(), code);
    }

    pub fn namespace_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        read(&self.state).namespaces.get(name).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        read(&self.state)
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn managed_resource(&self, namespace: &str, name: &str) -> Option<ManagedResource> {
        read(&self.state)
            .managed_resources
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn extension_count(&self) -> usize {
        read(&self.state).extensions.len()
    }

    pub fn counts(&self) -> SeedCounts {
        read(&self.counts).clone()
    }

    pub fn reset_counts(&self) {
        *write(&self.counts) = SeedCounts::default();
    }

    fn check(&self, op: SeedOp) -> Result<()> {
        match read(&self.state).failures.get(&op) {
            Some(code) => Err(failure(*code, &format!("{:?}", op))),
            None => Ok(()),
        }
    }

    fn count(&self, f: impl FnOnce(&mut SeedCounts)) {
        f(&mut write(&self.counts));
    }
}

#[async_trait]
impl SeedConnector for MockSeed {
    async fn connect(&self, seed: &Seed) -> Result<Arc<dyn SeedClient>> {
        self.count(|c| c.connects += 1);
        let injected = read(&self.state).failures.get(&SeedOp::Connect).copied();
        match injected {
            Some(404) => return Err(failure(404, "Connect")),
            Some(_) => {
                return Err(ControllerError::SeedConnection {
                    seed: seed.name_any(),
                    message: "injected failure: connect".to_string(),
                });
            }
            None => {}
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl SeedClient for MockSeed {
    async fn server_version(&self) -> Result<KubeVersion> {
        self.check(SeedOp::ServerVersion)?;
        Ok(read(&self.state).version.clone())
    }

    async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.count(|c| c.namespace_applies += 1);
        self.check(SeedOp::EnsureNamespace)?;
        write(&self.state)
            .namespaces
            .entry(name.to_string())
            .or_default()
            .extend(labels.clone());
        Ok(())
    }

    async fn reconcile_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        self.count(|c| c.secret_applies += 1);
        self.check(SeedOp::ReconcileSecret)?;
        write(&self.state)
            .secrets
            .insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }

    async fn reconcile_managed_resource(
        &self,
        namespace: &str,
        name: &str,
        secret_name: &str,
        class: &str,
    ) -> Result<()> {
        self.count(|c| c.managed_resource_applies += 1);
        self.check(SeedOp::ReconcileManagedResource)?;

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
        write(&self.state)
            .managed_resources
            .insert((namespace.to_string(), name.to_string()), resource);
        Ok(())
    }

    async fn list_extensions(&self) -> Result<Vec<Extension>> {
        self.count(|c| c.extension_lists += 1);
        self.check(SeedOp::ListExtensions)?;
        Ok(read(&self.state).extensions.values().cloned().collect())
    }

    async fn delete_extension(&self, namespace: &str, name: &str) -> Result<()> {
        self.count(|c| c.extension_deletes += 1);
        let mut state = write(&self.state);
        if let Some(code) = state.extension_delete_failures.get(name) {
            return Err(failure(*code, &format!("delete extension {}", name)));
        }

        let key = (namespace.to_string(), name.to_string());
        if !state.extensions.contains_key(&key) {
            return Err(not_found("Extension", name));
        }
        if !state.hold_extensions {
            state.extensions.remove(&key);
        }
        Ok(())
    }

    async fn delete_managed_resource(&self, namespace: &str, name: &str) -> Result<MrDeletion> {
        self.count(|c| c.managed_resource_deletes += 1);
        self.check(SeedOp::DeleteManagedResource)?;

        let mut state = write(&self.state);
        let key = (namespace.to_string(), name.to_string());
        if !state.managed_resources.contains_key(&key) {
            return Ok(MrDeletion::Gone);
        }
        if state.hold_managed_resources {
            return Ok(MrDeletion::StillPresent);
        }
        state.managed_resources.remove(&key);
        Ok(MrDeletion::Gone)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.count(|c| c.secret_deletes += 1);
        self.check(SeedOp::DeleteSecret)?;
        write(&self.state)
            .secrets
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found("Secret", name))
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.count(|c| c.namespace_deletes += 1);
        self.check(SeedOp::DeleteNamespace)?;
        write(&self.state)
            .namespaces
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("Namespace", name))
    }
}
