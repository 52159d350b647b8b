//! Seedpack Kube - Kubernetes integration for the extension installation controller
//!
//! This crate provides:
//! - **Resources**: Garden and seed custom resources (`ExtensionInstallation`, `Seed`, ...)
//! - **Reconciler**: Install and delete state machines publishing `Valid`/`Installed` conditions
//! - **Drain**: Concurrent removal of live extension instances before teardown
//! - **Seed Access**: Connecting to seeds and converging namespaces, secrets and managed resources
//! - **Dispatcher**: `kube::runtime::Controller` wiring with configurable requeue intervals
//! - **Mocks**: In-memory garden and seed for tests

pub mod config;
pub mod controller;
pub mod crd;
pub mod drain;
pub mod error;
pub mod mock;
pub mod reconciler;
pub mod registry;
pub mod seed;
pub mod seed_values;
pub mod writer;

pub use config::{ControllerConfig, ReconcileSettings, SeedClientSettings};
pub use controller::{kube_reconciler, reconcile_key, run};
pub use crd::{
    ExtensionInstallation, ExtensionInstallationSpec, ExtensionRegistration,
    ExtensionRegistrationSpec, Seed, SeedSpec,
};
pub use drain::{DrainOutcome, drain_extensions};
pub use error::{ControllerError, Result};
pub use mock::{GardenCounts, MockInstallationWriter, MockRegistry, MockSeed, SeedCounts, SeedOp};
pub use reconciler::{ChartSource, ReconcileOutcome, Reconciler, overlay_values};
pub use registry::{KubeRegistry, Registry};
pub use seed::{KubeSeedClient, KubeSeedConnector, MrDeletion, SeedClient, SeedConnector};
pub use seed_values::seed_values;
pub use writer::{InstallationWriter, KubeInstallationWriter};
