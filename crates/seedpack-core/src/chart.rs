//! Packaged charts
//!
//! A chart is a gzip tarball whose entries share a single top-level
//! directory (`<name>/Chart.yaml`, `<name>/values.yaml`,
//! `<name>/templates/...`). Registrations carry it base64-encoded.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Component, Path};
use tar::{Archive, Builder, Header};

use crate::error::{CoreError, Result};
use crate::values::Values;

const CHART_FILE: &str = "Chart.yaml";
const VALUES_FILE: &str = "values.yaml";
const TEMPLATES_DIR: &str = "templates/";

/// Chart.yaml contents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// Chart name (required)
    pub name: String,

    /// Chart version (required, SemVer)
    pub version: Version,

    #[serde(default)]
    pub description: Option<String>,

    /// Application version
    #[serde(default)]
    pub app_version: Option<String>,
}

/// A chart loaded in memory
#[derive(Debug, Clone)]
pub struct Chart {
    pub metadata: ChartMetadata,

    /// Default values from values.yaml
    pub values: Values,

    /// Template sources keyed by chart-relative path (`templates/...`)
    pub templates: BTreeMap<String, String>,
}

impl Chart {
    /// Load a chart from gzip tarball bytes
    pub fn from_archive(bytes: &[u8]) -> Result<Self> {
        let mut archive = Archive::new(GzDecoder::new(bytes));
        let mut files = BTreeMap::new();

        let entries = archive.entries().map_err(archive_error)?;
        for entry in entries {
            let mut entry = entry.map_err(archive_error)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let path = entry.path().map_err(archive_error)?.into_owned();
            let Some(relative) = strip_chart_dir(&path) else {
                continue;
            };

            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(archive_error)?;
            files.insert(relative, data);
        }

        Self::from_files(files)
    }

    /// Load a chart from base64-encoded gzip tarball
    pub fn from_blob(encoded: &str) -> Result<Self> {
        Self::from_archive(&decode_blob(encoded)?)
    }

    /// Load a chart from a directory
    pub fn from_dir<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_files(read_dir_files(path.as_ref())?)
    }

    /// Assemble a chart from chart-relative paths and their contents
    fn from_files(mut files: BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let chart_yaml = files.remove(CHART_FILE).ok_or_else(|| CoreError::InvalidChart {
            message: format!("{} not found", CHART_FILE),
        })?;
        let metadata: ChartMetadata = serde_yaml::from_slice(&chart_yaml)?;
        if metadata.name.trim().is_empty() {
            return Err(CoreError::InvalidChart {
                message: "chart name must not be empty".to_string(),
            });
        }

        let values = match files.remove(VALUES_FILE) {
            Some(raw) => Values::from_yaml(&utf8(VALUES_FILE, raw)?)?,
            None => Values::new(),
        };

        let mut templates = BTreeMap::new();
        for (path, raw) in files {
            if path.starts_with(TEMPLATES_DIR) {
                let source = utf8(&path, raw)?;
                templates.insert(path, source);
            }
        }

        Ok(Self {
            metadata,
            values,
            templates,
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Package a chart directory into gzip tarball bytes
///
/// The directory is validated as a chart first. Entries are written under
/// `<chart name>/` with a fixed mtime, so packaging the same directory twice
/// yields identical bytes.
pub fn package_dir<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let files = read_dir_files(path.as_ref())?;
    let chart = Chart::from_files(files.clone())?;
    let prefix = chart.name();

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    for (relative, content) in &files {
        let archive_path = format!("{}/{}", prefix, relative);
        add_bytes_to_archive(&mut builder, &archive_path, content)?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Base64-encode chart bytes the way registrations embed them
pub fn encode_blob(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a base64 chart blob
pub fn decode_blob(encoded: &str) -> Result<Vec<u8>> {
    let compact: String = encoded.split_whitespace().collect();
    BASE64.decode(compact).map_err(|e| CoreError::Archive {
        message: format!("chart is not valid base64: {}", e),
    })
}

/// Add bytes to a tar archive with a given path
fn add_bytes_to_archive<W: Write>(
    builder: &mut Builder<W>,
    archive_path: &str,
    content: &[u8],
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();

    builder.append_data(&mut header, archive_path, content)?;

    Ok(())
}

/// Read every regular file below `root`, keyed by `/`-separated relative path
fn read_dir_files(root: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    if !root.is_dir() {
        return Err(CoreError::InvalidChart {
            message: format!("{} is not a directory", root.display()),
        });
    }

    let mut files = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| CoreError::Archive {
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.insert(key, std::fs::read(entry.path())?);
    }

    Ok(files)
}

/// Drop the leading `<chart>/` component of an archive entry path
fn strip_chart_dir(path: &Path) -> Option<String> {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    match parts.split_first() {
        Some((_, rest)) if !rest.is_empty() => Some(rest.join("/")),
        Some((only, _)) => Some(only.clone()),
        None => None,
    }
}

fn utf8(path: &str, raw: Vec<u8>) -> Result<String> {
    String::from_utf8(raw).map_err(|e| CoreError::InvalidChart {
        message: format!("{} is not valid UTF-8: {}", path, e),
    })
}

fn archive_error(e: std::io::Error) -> CoreError {
    CoreError::Archive {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_chart(dir: &Path) {
        std::fs::write(
            dir.join("Chart.yaml"),
            "apiVersion: v2\nname: provider-test\nversion: 0.1.0\nappVersion: \"1.4\"\n",
        )
        .unwrap();
        std::fs::write(dir.join("values.yaml"), "replicas: 1\nimage:\n  tag: latest\n").unwrap();

        let templates = dir.join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(
            templates.join("configmap.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ release.name }}\n",
        )
        .unwrap();
        std::fs::write(templates.join("_helpers.tpl"), "{% macro name() %}x{% endmacro %}\n").unwrap();
    }

    #[test]
    fn test_load_from_dir() {
        let temp = TempDir::new().unwrap();
        create_test_chart(temp.path());

        let chart = Chart::from_dir(temp.path()).unwrap();

        assert_eq!(chart.name(), "provider-test");
        assert_eq!(chart.metadata.version, Version::new(0, 1, 0));
        assert_eq!(chart.metadata.app_version.as_deref(), Some("1.4"));
        assert_eq!(chart.values.get("image.tag").unwrap(), "latest");
        assert_eq!(
            chart.templates.keys().collect::<Vec<_>>(),
            vec!["templates/_helpers.tpl", "templates/configmap.yaml"]
        );
    }

    #[test]
    fn test_package_then_load_archive() {
        let temp = TempDir::new().unwrap();
        create_test_chart(temp.path());

        let bytes = package_dir(temp.path()).unwrap();
        let chart = Chart::from_archive(&bytes).unwrap();

        assert_eq!(chart.name(), "provider-test");
        assert_eq!(chart.templates.len(), 2);
        assert_eq!(chart.values.get("replicas").unwrap(), 1);
    }

    #[test]
    fn test_package_is_reproducible() {
        let temp = TempDir::new().unwrap();
        create_test_chart(temp.path());

        assert_eq!(package_dir(temp.path()).unwrap(), package_dir(temp.path()).unwrap());
    }

    #[test]
    fn test_blob_encoding() {
        let temp = TempDir::new().unwrap();
        create_test_chart(temp.path());

        let blob = encode_blob(&package_dir(temp.path()).unwrap());
        let chart = Chart::from_blob(&blob).unwrap();
        assert_eq!(chart.name(), "provider-test");
    }

    #[test]
    fn test_invalid_base64() {
        assert!(matches!(
            Chart::from_blob("not base64 !!"),
            Err(CoreError::Archive { .. })
        ));
    }

    #[test]
    fn test_missing_chart_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("values.yaml"), "a: 1\n").unwrap();

        assert!(matches!(
            Chart::from_dir(temp.path()),
            Err(CoreError::InvalidChart { .. })
        ));
    }

    #[test]
    fn test_garbage_archive() {
        assert!(Chart::from_archive(b"definitely not gzip").is_err());
    }
}
