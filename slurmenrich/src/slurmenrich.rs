// `slurmenrich` -- Attach Slurm job metadata to GPU telemetry
//
// Run with --help for brief help.
//
// `slurmenrich resolve` runs one resolution and prints the GPU to job mapping, the job IDs on the
// node and any warnings as JSON.
//
// `slurmenrich enrich` reads a telemetry batch (JSON, with any of resource_spans, resource_logs and
// resource_metrics), enriches it, and prints it.  Each signal in the batch is processed as a batch
// of its own, with its own resolution.
//
// Logging goes to stderr and is controlled by RUST_LOG, stdout carries only the JSON result.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use slurmmeta::{Config, Logs, MetadataSource, Metrics, SlurmProcessor, SystemClock, SystemQueries, Traces};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the GPU to job mapping of this node
    Resolve(ResolveArgs),

    /// Attach job metadata to a telemetry batch
    Enrich(EnrichArgs),
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    #[command(flatten)]
    config_args: ConfigArgs,
}

#[derive(Args, Debug)]
pub struct EnrichArgs {
    /// File holding the batch [default: stdin]
    #[arg(long)]
    input: Option<PathBuf>,

    #[command(flatten)]
    config_args: ConfigArgs,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// File containing the JSON configuration [default: none, built-in defaults]
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Where the metadata come from: nvml, slurmd, slurmctld, or "" to let --query-slurmctld decide
    /// [default: from the configuration]
    #[arg(long)]
    metadata_source: Option<String>,

    /// Without a metadata source, true selects slurmctld and false slurmd [default: from the
    /// configuration]
    #[arg(long)]
    query_slurmctld: Option<bool>,

    /// Seconds the slurmctld result is cached [default: from the configuration]
    #[arg(long)]
    cache_duration: Option<u64>,

    /// File in which the slurmctld result is cached [default: from the configuration]
    #[arg(long)]
    cache_filepath: Option<PathBuf>,

    /// Where procfs is mounted
    #[arg(long, default_value = "/proc")]
    proc_root: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

impl ConfigArgs {
    fn config(&self) -> Result<Config> {
        let mut config = match self.config_file {
            Some(ref filename) => Config::read_from_json(filename)
                .with_context(|| format!("Reading configuration {}", filename.display()))?,
            None => Config::default(),
        };
        if let Some(ref source) = self.metadata_source {
            config.metadata_source = if source.is_empty() {
                None
            } else {
                Some(MetadataSource::from_str(source)?)
            };
        }
        if let Some(query_slurmctld) = self.query_slurmctld {
            config.query_slurmctld = query_slurmctld;
        }
        if let Some(cache_duration) = self.cache_duration {
            config.cache_duration = cache_duration;
        }
        if let Some(ref cache_filepath) = self.cache_filepath {
            config.cache_filepath = cache_filepath.clone();
        }
        Ok(config)
    }
}

// The signals of a batch side by side.  Absent signals stay absent in the output.

#[derive(Debug, Default, Serialize, Deserialize)]
struct Batch {
    #[serde(flatten)]
    traces: Traces,

    #[serde(flatten)]
    logs: Logs,

    #[serde(flatten)]
    metrics: Metrics,
}

fn main() {
    match slurmenrich() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {:#}", msg);
            process::exit(1);
        }
    }
}

fn slurmenrich() -> Result<()> {
    let cli = Cli::parse();

    let config_args = match cli.command {
        Commands::Resolve(ref resolve_args) => &resolve_args.config_args,
        Commands::Enrich(ref enrich_args) => &enrich_args.config_args,
    };
    init_tracing(config_args.verbose);
    let config = config_args.config()?;
    debug!("configuration: {config:?}");
    let queries = SystemQueries::with_proc_root(config_args.proc_root.clone());

    match cli.command {
        Commands::Resolve(_) => {
            let resolution = slurmmeta::resolve(&config, &queries, &SystemClock)?;
            write_json(&resolution)
        }
        Commands::Enrich(ref enrich_args) => {
            let input = match enrich_args.input {
                Some(ref filename) => fs::read_to_string(filename)
                    .with_context(|| format!("Reading batch {}", filename.display()))?,
                None => {
                    let mut s = String::new();
                    io::stdin().read_to_string(&mut s)?;
                    s
                }
            };
            let mut batch: Batch = serde_json::from_str(&input).context("Parsing batch")?;

            let processor = SlurmProcessor::new(config, Box::new(queries), Box::new(SystemClock));
            processor.start();
            if !batch.traces.resource_spans.is_empty() {
                processor.process_traces(&mut batch.traces);
            }
            if !batch.logs.resource_logs.is_empty() {
                processor.process_logs(&mut batch.logs);
            }
            if !batch.metrics.resource_metrics.is_empty() {
                processor.process_metrics(&mut batch.metrics);
            }
            processor.shutdown();
            write_json(&batch)
        }
    }
}

fn write_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}
