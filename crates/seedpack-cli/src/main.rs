//! Seedpack CLI - installs extension charts onto seed clusters

use clap::{Parser, Subcommand};
use miette::Result;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "seedpack")]
#[command(author = "Seedpack Contributors")]
#[command(version)]
#[command(about = "Installs extension charts onto seed clusters", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Controller configuration file
    #[arg(short, long, global = true, env = "SEEDPACK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, env = "SEEDPACK_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the extension installation controller
    Run,

    /// Reconcile a single extension installation once
    Reconcile {
        /// Installation name
        name: String,
    },

    /// Render a chart directory with seed values, as the controller would
    Render {
        /// Chart directory
        chart: PathBuf,

        /// Seed manifest (YAML) providing the `gardener.seed` values
        #[arg(long)]
        seed: Option<PathBuf>,

        /// Registration name, used as release name and for override values
        #[arg(long, default_value = "extension")]
        registration: String,

        /// Installation name, determines the target namespace
        #[arg(long, default_value = "extension")]
        installation: String,

        /// Registration values file(s) to merge
        #[arg(short = 'f', long = "values")]
        values: Vec<PathBuf>,

        /// Set values on command line (key=value)
        #[arg(long = "set")]
        set: Vec<String>,

        /// Kubernetes version exposed to templates
        #[arg(long, default_value = "v1.31.0")]
        kube_version: String,

        /// Show the merged values
        #[arg(long)]
        show_values: bool,
    },

    /// Package a chart directory into the blob a registration embeds
    Package {
        /// Chart directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Write the blob to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Wrap the blob in a providerConfig document
        #[arg(long)]
        provider_config: bool,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run => commands::run::run(cli.config.as_deref()).await,

        Commands::Reconcile { name } => {
            commands::reconcile::run(&name, cli.config.as_deref()).await
        }

        Commands::Render {
            chart,
            seed,
            registration,
            installation,
            values,
            set,
            kube_version,
            show_values,
        } => commands::render::run(&commands::render::RenderArgs {
            chart: &chart,
            seed: seed.as_deref(),
            registration: &registration,
            installation: &installation,
            values_files: &values,
            set_values: &set,
            kube_version: &kube_version,
            show_values,
            config: cli.config.as_deref(),
        }),

        Commands::Package {
            path,
            output,
            provider_config,
        } => commands::package::run(&path, output.as_deref(), provider_config),
    }
}
