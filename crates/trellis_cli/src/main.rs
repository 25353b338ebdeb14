//! Trellis CLI
//!
//! Inspect and validate the configuration a pipeline run would use.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use trellis_config::{
    ConfigLayer, EffectiveConfig, LayerScope, PipelineDocument, ProjectDocument, RunOverrides, merge,
};

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Trellis - configuration-driven DAG pipeline runs", long_about = None)]
struct Cli {
    /// Log filter, e.g. `debug` or `trellis_config=trace`; falls back to RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective merged configuration
    Config {
        #[command(flatten)]
        sources: Sources,
        #[command(flatten)]
        run: RunFlags,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Yaml)]
        format: Format,
    },
    /// Load and validate configuration documents
    Validate {
        #[command(flatten)]
        sources: Sources,
        #[command(flatten)]
        run: RunFlags,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

/// Configuration documents
#[derive(Args, Debug, Default)]
struct Sources {
    /// Project document (YAML or JSON)
    #[arg(long)]
    project: Option<PathBuf>,
    /// Pipeline document (YAML or JSON)
    #[arg(short, long)]
    pipeline: Option<PathBuf>,
    /// Runtime configuration object (YAML or JSON)
    #[arg(long)]
    run_config: Option<PathBuf>,
}

/// Keyword overrides, one flag per run option
#[derive(Args, Debug, Default)]
struct RunFlags {
    /// Requested outputs
    #[arg(long, value_delimiter = ',')]
    final_vars: Vec<String>,
    /// Literal input, `name=value`
    #[arg(long = "input", value_parser = parse_key_value)]
    inputs: Vec<(String, Value)>,
    /// Conditional-selection entry, `key=value`
    #[arg(long = "config", value_parser = parse_key_value)]
    config: Vec<(String, Value)>,
    /// Executor type
    #[arg(long)]
    executor: Option<String>,
    /// Pool size
    #[arg(long)]
    max_workers: Option<usize>,
    /// CPU hint for distributed executors
    #[arg(long)]
    num_cpus: Option<f64>,
    /// Retries after the first attempt
    #[arg(long)]
    max_retries: Option<u32>,
    /// Base delay between attempts, in seconds
    #[arg(long)]
    retry_delay: Option<f64>,
    /// Relative jitter applied to the delay
    #[arg(long)]
    jitter_factor: Option<f64>,
    /// Error classifiers that trigger a retry
    #[arg(long, value_delimiter = ',')]
    retry_exceptions: Vec<String>,
    /// Cache policy: `true`, `false` or a YAML/JSON object
    #[arg(long, value_parser = parse_value)]
    cache: Option<Value>,
    /// Extra node modules
    #[arg(long, value_delimiter = ',')]
    additional_modules: Vec<String>,
    /// Rebuild the graph
    #[arg(long)]
    reload: bool,
    /// Log level recorded for the run
    #[arg(long)]
    run_log_level: Option<String>,
    /// Success callback identifier
    #[arg(long)]
    on_success: Option<String>,
    /// Failure callback identifier
    #[arg(long)]
    on_failure: Option<String>,
}

impl RunFlags {
    fn into_overrides(self) -> RunOverrides {
        fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
            (!v.is_empty()).then_some(v)
        }
        fn pairs(v: Vec<(String, Value)>) -> Option<Map<String, Value>> {
            (!v.is_empty()).then(|| v.into_iter().collect())
        }

        RunOverrides {
            final_vars: non_empty(self.final_vars),
            inputs: pairs(self.inputs),
            config: pairs(self.config),
            executor_type: self.executor,
            max_workers: self.max_workers,
            num_cpus: self.num_cpus,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            jitter_factor: self.jitter_factor,
            retry_exceptions: non_empty(self.retry_exceptions),
            cache: self.cache,
            additional_modules: non_empty(self.additional_modules),
            reload: self.reload.then_some(true),
            log_level: self.run_log_level,
            on_success: self.on_success.map(Value::String),
            on_failure: self.on_failure.map(Value::String),
            ..RunOverrides::default()
        }
    }
}

/// Parse a scalar or structured value; bare words stay strings
fn parse_value(text: &str) -> Result<Value, String> {
    serde_yaml::from_str::<Value>(text).map_err(|e| e.to_string())
}

fn parse_key_value(text: &str) -> Result<(String, Value), String> {
    let (key, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", text))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", text));
    }
    Ok((key.to_string(), parse_value(value)?))
}

fn load_object(path: &Path) -> Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    let value: Value = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&text).wrap_err_with(|| format!("parsing {}", path.display()))?
    } else {
        serde_yaml::from_str(&text).wrap_err_with(|| format!("parsing {}", path.display()))?
    };
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(eyre!("{} must contain an object", path.display())),
    }
}

fn effective(sources: Sources, run: RunFlags) -> Result<EffectiveConfig> {
    let mut layers = Vec::new();
    if let Some(path) = &sources.project {
        layers.push(ProjectDocument::load(path)?.layer());
    }
    if let Some(path) = &sources.pipeline {
        layers.push(PipelineDocument::load(path)?.layer());
    }
    if let Some(path) = &sources.run_config {
        layers.push(ConfigLayer::from_map(LayerScope::Runtime, load_object(path)?));
    }
    layers.push(run.into_overrides().into_layer());
    tracing::debug!(layers = layers.len(), "Merging configuration");
    Ok(merge(layers))
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command {
        Commands::Config {
            sources,
            run,
            format,
        } => {
            let config = effective(sources, run)?;
            let rendered = match format {
                Format::Json => serde_json::to_string_pretty(&config.to_json())?,
                Format::Yaml => serde_yaml::to_string(&config.to_json())?,
            };
            println!("{}", rendered.trim_end());
            Ok(())
        }
        Commands::Validate { sources, run } => {
            let config = effective(sources, run)?.into_run_config()?;
            println!(
                "Configuration is valid: {} output(s), executor {}, max_retries {}",
                config.final_vars.len(),
                config.executor.kind,
                config.retry.max_retries
            );
            Ok(())
        }
    }
}
