//! Package command - turn a chart directory into a registration blob

use console::style;
use miette::{IntoDiagnostic, Result, WrapErr};
use seedpack_core::{Chart, encode_blob, package_dir};
use serde_json::json;
use std::path::Path;

pub fn run(path: &Path, output: Option<&Path>, provider_config: bool) -> Result<()> {
    // Loading first validates Chart.yaml and the templates' encoding
    let chart = Chart::from_dir(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to load chart from {}", path.display()))?;

    let archive = package_dir(path).into_diagnostic()?;
    let document = render_document(&encode_blob(&archive), provider_config)?;

    match output {
        Some(output) => {
            std::fs::write(output, &document)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to write {}", output.display()))?;
            eprintln!(
                "{} {} v{} ({} bytes compressed) to {}",
                style("Packaged").green().bold(),
                chart.metadata.name,
                chart.metadata.version,
                archive.len(),
                output.display()
            );
        }
        None => println!("{}", document),
    }

    Ok(())
}

/// The bare blob, or a `providerConfig` document embedding it
fn render_document(blob: &str, provider_config: bool) -> Result<String> {
    if !provider_config {
        return Ok(blob.to_string());
    }

    let config = json!({
        "providerConfig": {
            "chart": blob,
            "values": {}
        }
    });
    serde_yaml::to_string(&config).into_diagnostic()
}
