//! Controller configuration
//!
//! Loaded from a YAML file; every field has a default so an absent file and
//! an empty file both yield a working configuration.

use serde::{Deserialize, Serialize};
use seedpack_core::Values;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{ControllerError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Identity of the garden, exposed to charts as `gardener.garden.identity`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garden_identity: Option<String>,

    #[serde(default)]
    pub controller: ReconcileSettings,

    #[serde(default)]
    pub seed_client: SeedClientSettings,

    /// Per-registration values overlaid on the seed values
    #[serde(default)]
    pub override_values: BTreeMap<String, serde_json::Value>,
}

/// Dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSettings {
    /// Maximum number of installations reconciled at once
    #[serde(default = "default_concurrent_syncs")]
    pub concurrent_syncs: u16,

    /// Requeue interval for installations in a steady state
    #[serde(default = "default_sync_period", with = "humantime_serde")]
    pub sync_period: Duration,

    /// Requeue interval after a failed pass
    #[serde(default = "default_error_requeue", with = "humantime_serde")]
    pub error_requeue: Duration,

    /// Requeue interval while a deletion is pending
    #[serde(default = "default_pending_requeue", with = "humantime_serde")]
    pub pending_requeue: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            concurrent_syncs: default_concurrent_syncs(),
            sync_period: default_sync_period(),
            error_requeue: default_error_requeue(),
            pending_requeue: default_pending_requeue(),
        }
    }
}

fn default_concurrent_syncs() -> u16 {
    5
}

fn default_sync_period() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_error_requeue() -> Duration {
    Duration::from_secs(30)
}

fn default_pending_requeue() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedClientSettings {
    /// Use the controller's own cluster for seeds without a `secretRef`
    #[serde(default = "default_true")]
    pub default_to_local: bool,
}

impl Default for SeedClientSettings {
    fn default() -> Self {
        Self {
            default_to_local: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl ControllerConfig {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load from `path` if given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Override values configured for a registration
    ///
    /// `Ok(None)` when nothing is configured; an error when the configured
    /// entry is not a mapping.
    pub fn override_values_for(&self, registration: &str) -> Result<Option<Values>> {
        let Some(raw) = self.override_values.get(registration) else {
            return Ok(None);
        };

        Values::from_mapping(raw.clone())
            .map(Some)
            .map_err(|e| {
                ControllerError::InvalidConfig(format!(
                    "override values for registration '{}': {}",
                    registration, e
                ))
            })
    }
}
