//! Render command - render a chart directory locally
//!
//! Values are layered exactly as the controller layers them: seed values,
//! configured overrides, then the registration's values (here: `-f` files
//! and `--set` arguments).

use console::style;
use miette::{IntoDiagnostic, Report, Result, WrapErr};
use seedpack_core::{Chart, KubeVersion, Values, parse_set_values};
use seedpack_engine::{EngineError, EngineRenderer};
use seedpack_kube::crd::extension_namespace;
use seedpack_kube::{ControllerConfig, Seed, overlay_values, seed_values};
use std::path::{Path, PathBuf};

pub struct RenderArgs<'a> {
    pub chart: &'a Path,
    pub seed: Option<&'a Path>,
    pub registration: &'a str,
    pub installation: &'a str,
    pub values_files: &'a [PathBuf],
    pub set_values: &'a [String],
    pub kube_version: &'a str,
    pub show_values: bool,
    pub config: Option<&'a Path>,
}

pub fn run(args: &RenderArgs<'_>) -> Result<()> {
    let chart = Chart::from_dir(args.chart)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to load chart from {}", args.chart.display()))?;

    let config = ControllerConfig::load(args.config)
        .into_diagnostic()
        .wrap_err("Failed to load controller configuration")?;

    let base = match args.seed {
        Some(path) => {
            let seed = load_seed(path)?;
            seed_values(&seed, config.garden_identity.as_deref()).into_diagnostic()?
        }
        None => Values::new(),
    };

    let registration_values = registration_values(args.values_files, args.set_values)?;
    let values = overlay_values(base, &config, args.registration, &registration_values);

    if args.show_values {
        let yaml = serde_yaml::to_string(values.inner()).into_diagnostic()?;
        println!("{}", style("# Values").dim());
        println!("{}", yaml);
    }

    let namespace = extension_namespace(args.installation);
    let renderer = EngineRenderer::for_version(KubeVersion::new(args.kube_version));
    let rendered = renderer
        .render(&chart, args.registration, &namespace, &values)
        .map_err(|e| match e {
            EngineError::Template(template_error) => Report::new(template_error),
            other => Report::msg(other.to_string()),
        })?;

    if rendered.is_empty() {
        eprintln!("{} chart rendered no manifests", style("warning:").yellow().bold());
    }
    print!("{}", rendered.manifest());

    if let Some(notes) = &rendered.notes {
        eprintln!();
        eprintln!("{}", style("NOTES:").bold());
        eprintln!("{}", notes);
    }

    Ok(())
}

fn load_seed(path: &Path) -> Result<Seed> {
    let content = std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read seed manifest {}", path.display()))?;
    serde_yaml::from_str(&content)
        .into_diagnostic()
        .wrap_err_with(|| format!("Invalid seed manifest {}", path.display()))
}

fn registration_values(files: &[PathBuf], set_values: &[String]) -> Result<Values> {
    let mut values = Values::new();

    for file in files {
        let file_values = Values::from_file(file)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to load values file: {}", file.display()))?;
        values.merge(&file_values);
    }

    if !set_values.is_empty() {
        let set = parse_set_values(set_values)
            .into_diagnostic()
            .wrap_err("Failed to parse --set values")?;
        values.merge(&set);
    }

    Ok(values)
}
