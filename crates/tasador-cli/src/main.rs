//! Tasador CLI
//!
//! The `tasador` command drives the real-estate price pipeline.
//!
//! ## Commands
//!
//! - `run`: ingest → process → train → promote as one DAG
//! - `ingest`, `process`, `train`: individual steps
//! - `select`, `promote`, `retry-archive`: registry stage management
//! - `versions`: list registered versions and their stages
//! - `validate`: check configuration and environment

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tasador_core::{
    ingest, process, promote_best, Backend, BackendKind, PipelineConfig, PipelineSpan,
    RegistryConfig, TasadorError, METRICS,
};
use tasador_pipeline::{estate_pipeline, PipelineReport, PipelineRunner, StepStatus};
use tasador_state::ModelRegistry;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "tasador")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Train, select and promote the real-estate price model", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON results
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file (TOML)
    #[arg(long, global = true, env = "TASADOR_CONFIG")]
    config: Option<PathBuf>,

    /// Registry backend, overrides the configuration file
    #[arg(long, global = true, env = "TASADOR_BACKEND")]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole pipeline
    Run {
        /// Upper bound for each step attempt, in seconds
        #[arg(long)]
        step_timeout_secs: Option<u64>,
    },

    /// Read the raw dataset and report its shape
    Ingest {
        /// Raw CSV (default: configured raw_data)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Derive price_m2 and write the processed dataset
    Process {
        #[arg(short, long)]
        input: Option<PathBuf>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Train on the processed dataset and register a new version
    Train {
        /// Processed CSV (default: configured processed_data)
        #[arg(short, long)]
        data: Option<PathBuf>,
    },

    /// Show which version the promotion policy would pick
    Select,

    /// Promote the best version, or the given one
    Promote {
        #[arg(long)]
        version: Option<u64>,
    },

    /// Archive leftover Production versions after a partial promotion
    RetryArchive {
        /// The version that was promoted
        #[arg(long)]
        version: u64,
    },

    /// List registered versions of the model
    Versions,

    /// Check configuration and registry environment
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tasador_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref(), cli.backend)?;
    let out = Output { json: cli.json };

    let result = match cli.command {
        Commands::Ingest { input } => cmd_ingest(&config, input.as_deref(), out),
        Commands::Process { input, output } => {
            cmd_process(&config, input.as_deref(), output.as_deref(), out)
        }
        Commands::Validate => cmd_validate(&config, out),
        Commands::Run { step_timeout_secs } => {
            let backend = connect(&config).await?;
            cmd_run(&backend, &config, step_timeout_secs.map(Duration::from_secs), out).await
        }
        Commands::Train { data } => {
            let backend = connect(&config).await?;
            cmd_train(&backend, &config, data.as_deref(), out).await
        }
        Commands::Select => cmd_select(&connect(&config).await?, &config, out).await,
        Commands::Promote { version } => cmd_promote(&connect(&config).await?, &config, version, out).await,
        Commands::RetryArchive { version } => {
            cmd_retry_archive(&connect(&config).await?, &config, version, out).await
        }
        Commands::Versions => cmd_versions(&connect(&config).await?, &config, out).await,
    };

    METRICS.flush();
    result
}

async fn connect(config: &PipelineConfig) -> Result<Backend> {
    Backend::connect(config)
        .await
        .with_context(|| format!("failed to connect to the {} backend", config.backend.kind))
}

fn load_config(path: Option<&Path>, backend: Option<BackendKind>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(kind) = backend {
        config.backend.kind = kind;
    }
    Ok(config)
}

/// Prints results as text or pretty JSON.
#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text(value));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dataset commands
// ---------------------------------------------------------------------------

fn cmd_ingest(config: &PipelineConfig, input: Option<&Path>, out: Output) -> Result<()> {
    let input = input.unwrap_or(config.raw_data.as_path());
    let summary = ingest(input).with_context(|| format!("failed to ingest {}", input.display()))?;
    out.emit(&summary, |s| {
        format!("{}: {} rows, columns {}", s.path.display(), s.rows, s.columns.join(", "))
    })
}

fn cmd_process(config: &PipelineConfig, input: Option<&Path>, output: Option<&Path>, out: Output) -> Result<()> {
    let input = input.unwrap_or(config.raw_data.as_path());
    let output = output.unwrap_or(config.processed_data.as_path());
    let summary = process(input, output).with_context(|| format!("failed to process {}", input.display()))?;
    out.emit(&summary, |s| format!("Wrote {} rows to {}", s.rows, s.output.display()))
}

#[derive(Serialize)]
struct Validation {
    backend: String,
    model_name: String,
    raw_data: PathBuf,
    raw_data_present: bool,
    processed_data: PathBuf,
    processed_data_present: bool,
    tracking_uri: Option<String>,
}

fn cmd_validate(config: &PipelineConfig, out: Output) -> Result<()> {
    config.validate().context("invalid pipeline configuration")?;

    let tracking_uri = match config.backend.kind {
        BackendKind::Mlflow => {
            let registry = RegistryConfig::from_env().context("registry environment incomplete")?;
            Some(registry.tracking_uri)
        }
        BackendKind::Surreal => None,
    };

    let report = Validation {
        backend: config.backend.kind.to_string(),
        model_name: config.model_name.clone(),
        raw_data_present: config.raw_data.exists(),
        raw_data: config.raw_data.clone(),
        processed_data_present: config.processed_data.exists(),
        processed_data: config.processed_data.clone(),
        tracking_uri,
    };
    out.emit(&report, |r| {
        let mut lines = vec![format!("Configuration OK (backend: {}, model: {})", r.backend, r.model_name)];
        if let Some(uri) = &r.tracking_uri {
            lines.push(format!("Tracking URI: {}", uri));
        }
        lines.push(format!("Raw data:       {} ({})", r.raw_data.display(), present(r.raw_data_present)));
        lines.push(format!(
            "Processed data: {} ({})",
            r.processed_data.display(),
            present(r.processed_data_present)
        ));
        lines.join("\n")
    })
}

fn present(exists: bool) -> &'static str {
    if exists {
        "present"
    } else {
        "missing"
    }
}

// ---------------------------------------------------------------------------
// Registry commands
// ---------------------------------------------------------------------------

async fn cmd_run(
    backend: &Backend,
    config: &PipelineConfig,
    step_timeout: Option<Duration>,
    out: Output,
) -> Result<()> {
    let _span = PipelineSpan::enter(tasador_pipeline::estate::PIPELINE, &config.model_name);

    let graph = estate_pipeline(backend, config)?;
    let mut runner = PipelineRunner::new(config.retry.clone());
    if let Some(limit) = step_timeout {
        runner = runner.with_step_timeout(limit);
    }
    let report = runner.run(tasador_pipeline::estate::PIPELINE, &graph).await?;

    out.emit(&report, render_report)?;
    report.into_result().context("pipeline failed")?;
    Ok(())
}

fn render_report(report: &PipelineReport) -> String {
    report
        .steps
        .iter()
        .map(|record| match &record.status {
            StepStatus::Succeeded => format!(
                "{:<8} ok       {}ms ({} attempt(s))",
                record.step, record.duration_ms, record.attempts
            ),
            StepStatus::Failed { error } => format!(
                "{:<8} FAILED   after {} attempt(s): {}",
                record.step, record.attempts, error
            ),
            StepStatus::Skipped { upstream } => {
                format!("{:<8} skipped  ({} failed)", record.step, upstream)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn cmd_train(backend: &Backend, config: &PipelineConfig, data: Option<&Path>, out: Output) -> Result<()> {
    let data = data.unwrap_or(config.processed_data.as_path());
    let report = backend
        .trainer(config)
        .train(data)
        .await
        .with_context(|| format!("training on {} failed", data.display()))?;

    out.emit(&report, |r| {
        let mut lines = vec![
            format!("Run:     {}", r.run_id),
            format!("{}: {:.4}", r.metric_key, r.score),
            match r.version {
                Some(v) => format!("Version: {} (stage None)", v),
                None => "Version: none, metrics-only run".to_string(),
            },
        ];
        lines.extend(r.recovered.iter().map(|e| format!("warning: {}", e)));
        lines.join("\n")
    })
}

async fn cmd_select(backend: &Backend, config: &PipelineConfig, out: Output) -> Result<()> {
    let report = backend
        .policy(&config.metric_key)
        .evaluate(&config.model_name)
        .await
        .context("failed to evaluate versions")?;

    out.emit(&report, |r| {
        let mut lines: Vec<String> = r
            .candidates
            .iter()
            .map(|c| format!("v{:<4} {} = {:.4}", c.version, r.metric_key, c.metric))
            .collect();
        lines.extend(r.skipped.iter().map(|s| format!("v{:<4} skipped: {}", s.version, s.reason)));
        lines.push(match &r.selected {
            Some(best) => format!("Selected v{}", best.version),
            None => format!("No promotion candidate for '{}'", r.model_name),
        });
        lines.join("\n")
    })
}

async fn cmd_promote(backend: &Backend, config: &PipelineConfig, version: Option<u64>, out: Output) -> Result<()> {
    let result = match version {
        Some(version) => backend.executor().promote(&config.model_name, version).await,
        None => {
            let policy = backend.policy(&config.metric_key);
            match promote_best(&policy, &backend.executor(), &config.model_name).await {
                Ok((_, result)) => Ok(result),
                Err(TasadorError::NoPromotionCandidate(model)) => {
                    warn!(model = %model, "no promotion candidate, stages unchanged");
                    println!("No promotion candidate for '{}'; stages unchanged", model);
                    return Ok(());
                }
                Err(err) => Err(err),
            }
        }
    };

    let result = match result {
        Ok(result) => result,
        Err(TasadorError::PartialPromotion(partial)) => {
            anyhow::bail!(
                "{}; finish with `tasador retry-archive --version {}`",
                partial,
                partial.promoted_version
            )
        }
        Err(err) => return Err(err).context("promotion failed"),
    };

    info!(model = %result.model_name, version = result.version, "promotion done");
    out.emit(&result, |r| {
        let mut line = format!("{} v{} is Production ({:?})", r.model_name, r.version, r.status);
        if !r.archived.is_empty() {
            line.push_str(&format!(", archived {:?}", r.archived));
        }
        line
    })
}

async fn cmd_retry_archive(backend: &Backend, config: &PipelineConfig, version: u64, out: Output) -> Result<()> {
    let result = backend
        .executor()
        .retry_archival(&config.model_name, version)
        .await
        .context("archival retry failed")?;
    out.emit(&result, |r| format!("{} v{}: archived {:?}", r.model_name, r.version, r.archived))
}

async fn cmd_versions(backend: &Backend, config: &PipelineConfig, out: Output) -> Result<()> {
    let versions = backend
        .tracking()
        .list_versions(&config.model_name)
        .await
        .context("failed to list versions")?;

    out.emit(&versions, |vs| {
        if vs.is_empty() {
            return format!("No versions registered for '{}'", config.model_name);
        }
        vs.iter()
            .map(|v| format!("v{:<4} {:<10} run {}", v.version, v.stage, v.run_id))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasador_state::Stage;

    fn write_listings(dir: &Path) -> PipelineConfig {
        let mut body = String::from("price,bed,bath,house_size\n");
        for i in 0..30usize {
            let (bed, bath, size) = (1 + i % 4, 1 + i % 3, 70 + (i * 29) % 300);
            let price = 18000 * bed + 12000 * bath + 2900 * size + 30000;
            body.push_str(&format!("{},{},{},{}\n", price, bed, bath, size));
        }
        std::fs::write(dir.join("raw.csv"), body).unwrap();
        PipelineConfig {
            raw_data: dir.join("raw.csv"),
            processed_data: dir.join("processed.csv"),
            seed: Some(1),
            ..PipelineConfig::default()
        }
    }

    const OUT: Output = Output { json: true };

    #[tokio::test]
    async fn run_then_versions_shows_production() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_listings(dir.path());
        let backend = Backend::in_memory(Duration::from_secs(5));

        cmd_run(&backend, &config, None, OUT).await.unwrap();
        cmd_versions(&backend, &config, OUT).await.unwrap();

        let versions = backend.tracking().list_versions(&config.model_name).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].stage, Stage::Production);
    }

    #[tokio::test]
    async fn run_fails_on_missing_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            raw_data: dir.path().join("absent.csv"),
            ..PipelineConfig::default()
        };
        let backend = Backend::in_memory(Duration::from_secs(5));

        assert!(cmd_run(&backend, &config, None, OUT).await.is_err());
    }

    #[tokio::test]
    async fn promote_without_candidate_is_not_an_error() {
        let backend = Backend::in_memory(Duration::from_secs(5));
        cmd_promote(&backend, &PipelineConfig::default(), None, OUT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn promote_unknown_version_fails() {
        let backend = Backend::in_memory(Duration::from_secs(5));
        let err = cmd_promote(&backend, &PipelineConfig::default(), Some(9), OUT)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("not found"));
    }

    #[tokio::test]
    async fn step_commands_share_configured_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_listings(dir.path());
        let backend = Backend::in_memory(Duration::from_secs(5));

        cmd_ingest(&config, None, OUT).unwrap();
        cmd_process(&config, None, None, OUT).unwrap();
        assert!(config.processed_data.exists());
        cmd_train(&backend, &config, None, OUT).await.unwrap();
        cmd_select(&backend, &config, OUT).await.unwrap();
        cmd_promote(&backend, &config, Some(1), OUT).await.unwrap();
        cmd_retry_archive(&backend, &config, 1, OUT).await.unwrap();
    }

    #[test]
    fn validate_surreal_needs_no_registry_env() {
        let mut config = PipelineConfig::default();
        config.backend.kind = BackendKind::Surreal;
        cmd_validate(&config, OUT).unwrap();
    }

    #[test]
    fn config_file_and_backend_flag_combine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasador.toml");
        std::fs::write(&path, "model_name = \"other_model\"\n").unwrap();

        let config = load_config(Some(&path), Some(BackendKind::Surreal)).unwrap();
        assert_eq!(config.model_name, "other_model");
        assert_eq!(config.backend.kind, BackendKind::Surreal);
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["tasador", "promote", "--version", "3", "--backend", "surreal", "--json"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.backend, Some(BackendKind::Surreal));
        assert!(matches!(cli.command, Commands::Promote { version: Some(3) }));
    }
}
