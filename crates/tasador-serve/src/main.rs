use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tasador_core::{init_tracing, Backend, BackendKind, ModelHolder, PipelineConfig, METRICS};
use tasador_serve::{serve, AppState, DEFAULT_BIND, ENV_BIND};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "tasador-serve")]
#[command(about = "Serve price predictions from the Production model", long_about = None)]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(long, env = ENV_BIND, default_value = DEFAULT_BIND)]
    bind: String,

    /// Pipeline configuration file (TOML)
    #[arg(long, env = "TASADOR_CONFIG")]
    config: Option<PathBuf>,

    /// Registry backend, overrides the configuration file
    #[arg(long, env = "TASADOR_BACKEND")]
    backend: Option<BackendKind>,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(args.json, level);

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(kind) = args.backend {
        config.backend.kind = kind;
    }

    let holder = load_holder(&config).await;
    let state = AppState::new(holder).context("failed to set up metrics")?;
    let result = serve(&args.bind, state)
        .await
        .with_context(|| format!("prediction API on {} stopped", args.bind));
    METRICS.flush();
    result
}

/// The only model load of the process. Any failure yields an empty holder.
async fn load_holder(config: &PipelineConfig) -> ModelHolder {
    match Backend::connect(config).await {
        Ok(backend) => {
            let holder = backend.loader().load_production(&config.model_name).await;
            info!(model = %config.model_name, loaded = holder.is_loaded(), "startup load finished");
            holder
        }
        Err(err) => {
            warn!(backend = %config.backend.kind, error = %err, "registry unreachable, serving without a model");
            ModelHolder::empty()
        }
    }
}
