//! Chart rendering for a target cluster

use seedpack_core::{Capabilities, Chart, KubeVersion, ReleaseInfo, TemplateContext, Values};

use crate::engine::{Engine, RenderedChart};
use crate::error::Result;

/// Renders packaged charts into named manifests
///
/// Implementations are bound to one cluster, whose version is exposed to
/// templates as `capabilities.kubeVersion`.
pub trait ChartRenderer: Send + Sync {
    /// Render a gzip tarball chart
    ///
    /// Chart defaults have the lowest precedence; `values` are overlaid on
    /// top of them.
    fn render_archive(
        &self,
        archive: &[u8],
        release_name: &str,
        namespace: &str,
        values: &Values,
    ) -> Result<RenderedChart>;
}

/// MiniJinja-backed renderer
#[derive(Debug, Clone)]
pub struct EngineRenderer {
    engine: Engine,
    capabilities: Capabilities,
}

impl EngineRenderer {
    pub fn new(engine: Engine, capabilities: Capabilities) -> Self {
        Self {
            engine,
            capabilities,
        }
    }

    /// Strict renderer for a cluster running `version`
    pub fn for_version(version: KubeVersion) -> Self {
        Self::new(Engine::default(), Capabilities::for_version(version))
    }

    /// Render an already loaded chart
    pub fn render(
        &self,
        chart: &Chart,
        release_name: &str,
        namespace: &str,
        values: &Values,
    ) -> Result<RenderedChart> {
        let merged = chart.values.clone().overlaid(values);
        let release = ReleaseInfo::for_install(release_name, namespace);
        let context = TemplateContext::new(merged, release, &chart.metadata)
            .with_capabilities(self.capabilities.clone());

        self.engine.render_chart(chart, &context)
    }
}

impl ChartRenderer for EngineRenderer {
    fn render_archive(
        &self,
        archive: &[u8],
        release_name: &str,
        namespace: &str,
        values: &Values,
    ) -> Result<RenderedChart> {
        let chart = Chart::from_archive(archive)?;
        self.render(&chart, release_name, namespace, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineError;
    use tempfile::TempDir;

    fn packaged_chart() -> Vec<u8> {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("Chart.yaml"),
            "name: provider-local\nversion: 1.0.0\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("values.yaml"), "replicas: 1\nregion: default\n").unwrap();
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        std::fs::write(
            dir.path().join("templates/config.yaml"),
            "replicas: {{ values.replicas }}\nregion: {{ values.region }}\nminor: {{ capabilities.kubeVersion.minor }}\n",
        )
        .unwrap();

        seedpack_core::package_dir(dir.path()).unwrap()
    }

    #[test]
    fn test_values_override_chart_defaults() {
        let renderer = EngineRenderer::for_version(KubeVersion::new("v1.30.1"));
        let values = Values::from_yaml("region: eu-west-1").unwrap();

        let rendered = renderer
            .render_archive(&packaged_chart(), "provider-local", "extension-provider-local", &values)
            .unwrap();

        let config = &rendered.files["provider-local/templates/config.yaml"];
        assert_eq!(config, "replicas: 1\nregion: eu-west-1\nminor: 30");
    }

    #[test]
    fn test_broken_archive_is_a_chart_error() {
        let renderer = EngineRenderer::for_version(KubeVersion::default());
        let err = renderer
            .render_archive(b"garbage", "x", "y", &Values::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Chart(_)));
    }
}
