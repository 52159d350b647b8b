//! Template rendering context

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::chart::ChartMetadata;
use crate::values::Values;

/// Context available to all templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateContext {
    /// Merged values
    pub values: JsonValue,

    /// Release information
    pub release: ReleaseInfo,

    /// Chart metadata
    pub chart: ChartInfo,

    /// Cluster capabilities
    pub capabilities: Capabilities,
}

/// Release information for templates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Revision number
    pub revision: u32,

    /// Is this an install operation?
    pub is_install: bool,

    /// Is this an upgrade operation?
    pub is_upgrade: bool,

    /// Service (always "Seedpack")
    pub service: String,
}

impl ReleaseInfo {
    /// Create release info for an install
    ///
    /// Extensions are re-rendered on every pass, so every render is an install.
    pub fn for_install(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision: 1,
            is_install: true,
            is_upgrade: false,
            service: "Seedpack".to_string(),
        }
    }
}

/// Chart information for templates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartInfo {
    pub name: String,
    pub version: String,
    pub app_version: Option<String>,
}

impl From<&ChartMetadata> for ChartInfo {
    fn from(meta: &ChartMetadata) -> Self {
        Self {
            name: meta.name.clone(),
            version: meta.version.to_string(),
            app_version: meta.app_version.clone(),
        }
    }
}

/// Cluster capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Kubernetes version
    pub kube_version: KubeVersion,

    /// Available API versions
    pub api_versions: Vec<String>,
}

impl Capabilities {
    pub fn for_version(version: KubeVersion) -> Self {
        Self {
            kube_version: version,
            api_versions: Vec::new(),
        }
    }
}

/// Kubernetes version info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeVersion {
    pub version: String,
    pub major: String,
    pub minor: String,
}

impl Default for KubeVersion {
    fn default() -> Self {
        Self {
            version: "v1.31.0".to_string(),
            major: "1".to_string(),
            minor: "31".to_string(),
        }
    }
}

impl KubeVersion {
    /// Parse a `git_version` string such as `v1.30.2-eks-1234`
    pub fn new(version: &str) -> Self {
        let version = version.trim_start_matches('v');
        let mut parts = version.split('.');
        let major = parts.next().filter(|p| !p.is_empty()).unwrap_or("1");
        let minor = parts.next().unwrap_or("31");

        Self {
            version: format!("v{}", version),
            major: major.to_string(),
            minor: minor.trim_end_matches('+').to_string(),
        }
    }

    /// Build from the major/minor pair the API server reports
    pub fn from_parts(major: &str, minor: &str, git_version: &str) -> Self {
        Self {
            version: git_version.to_string(),
            major: major.to_string(),
            minor: minor.trim_end_matches('+').to_string(),
        }
    }
}

impl TemplateContext {
    /// Create a new template context
    pub fn new(values: Values, release: ReleaseInfo, chart: &ChartMetadata) -> Self {
        Self {
            values: values.into_inner(),
            release,
            chart: ChartInfo::from(chart),
            capabilities: Capabilities::default(),
        }
    }

    /// Set capabilities
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}
