//! WolfMirror - Concurrent Document Replication
//!
//! Command-line front end: loads the configuration, reads the operation and
//! target list, runs the replication job and prints the report.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmirror::config::{LoggingConfig, MirrorConfig};
use wolfmirror::error::{Error, Result};
use wolfmirror::operation::OperationDescriptor;
use wolfmirror::replication::{ReplicaTarget, ReplicationRun, Replicator};
use wolfmirror::report::{render_outcomes, render_summary};
use wolfmirror::store::StoreConnector;

/// WolfMirror - Concurrent Document Replication
#[derive(Parser)]
#[command(name = "wolfmirror")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmirror.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate one operation to the target replicas
    Run {
        /// Operation descriptor as JSON, or @path to a JSON file
        #[arg(short, long, env = "WOLFMIRROR_OPERATION")]
        operation: String,

        /// Target ids as a JSON array or comma list, or @path; defaults to every configured replica
        #[arg(short, long, env = "WOLFMIRROR_TARGETS")]
        targets: Option<String>,

        /// Override replication.max_concurrent
        #[arg(long, env = "WOLFMIRROR_MAX_CONCURRENT")]
        max_concurrent: Option<usize>,

        /// Override replication.connect_timeout_ms
        #[arg(long)]
        connect_timeout_ms: Option<u64>,

        /// Report format
        #[arg(long, value_enum, default_value = "table")]
        output: OutputFormat,
    },

    /// Show how targets would be resolved and batched, without connecting
    Plan {
        /// Target ids as a JSON array or comma list, or @path
        #[arg(short, long, env = "WOLFMIRROR_TARGETS")]
        targets: Option<String>,

        /// Override replication.max_concurrent
        #[arg(long, env = "WOLFMIRROR_MAX_CONCURRENT")]
        max_concurrent: Option<usize>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmirror.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = match cli.command {
        Commands::Init { .. } => None,
        _ => Some(MirrorConfig::from_file(&cli.config)),
    };

    let logging = loaded
        .as_ref()
        .and_then(|config| config.as_ref().ok())
        .map(|config| config.logging.clone())
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref(), &logging);

    match cli.command {
        Commands::Init { output, force } => run_init(&output, force),
        Commands::Validate => run_validate(&cli.config, required(loaded, &cli.config)?),
        Commands::Plan {
            targets,
            max_concurrent,
        } => {
            let mut config = required(loaded, &cli.config)?;
            apply_overrides(&mut config, max_concurrent, None)?;
            run_plan(&config, targets.as_deref())
        }
        Commands::Run {
            operation,
            targets,
            max_concurrent,
            connect_timeout_ms,
            output,
        } => {
            let mut config = required(loaded, &cli.config)?;
            apply_overrides(&mut config, max_concurrent, connect_timeout_ms)?;
            let run = run_replicate(&config, &operation, targets.as_deref()).await?;
            print_run(&run, output)?;
            std::process::exit(run.report.exit_code());
        }
    }
}

/// Initialize logging
fn init_logging(level: Option<&str>, logging: &LoggingConfig) {
    let level = level.unwrap_or(&logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn required(loaded: Option<Result<MirrorConfig>>, path: &Path) -> Result<MirrorConfig> {
    match loaded {
        Some(Ok(config)) => Ok(config),
        Some(Err(e)) => {
            tracing::error!("Failed to load configuration from {:?}: {}", path, e);
            Err(e)
        }
        None => MirrorConfig::from_file(path),
    }
}

fn apply_overrides(
    config: &mut MirrorConfig,
    max_concurrent: Option<usize>,
    connect_timeout_ms: Option<u64>,
) -> Result<()> {
    if let Some(limit) = max_concurrent {
        config.replication.max_concurrent = limit;
    }
    if let Some(timeout_ms) = connect_timeout_ms {
        config.replication.connect_timeout_ms = timeout_ms;
    }
    config.validate()
}

/// Read an argument that is either inline text or `@path`
fn read_input(raw: &str) -> Result<String> {
    match raw.strip_prefix('@') {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => Ok(raw.to_string()),
    }
}

fn resolve_targets(config: &MirrorConfig, raw: Option<&str>) -> Result<Vec<ReplicaTarget>> {
    let Some(raw) = raw else {
        return Ok(config
            .replicas
            .keys()
            .map(|id| ReplicaTarget::new(id.clone()))
            .collect());
    };

    let text = read_input(raw)?;
    let text = text.trim();
    if text.starts_with('[') {
        return ReplicaTarget::list_from_json(text);
    }

    Ok(text
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ReplicaTarget::from)
        .collect())
}

/// Replicate one operation
async fn run_replicate(
    config: &MirrorConfig,
    operation: &str,
    targets: Option<&str>,
) -> Result<ReplicationRun> {
    let targets = resolve_targets(config, targets)?;
    let replicator = Replicator::new(config, Arc::new(StoreConnector::new(config)));

    tracing::info!(
        "Loaded {} replica endpoint(s), max {} concurrent",
        replicator.registry().len(),
        config.replication.max_concurrent
    );

    match OperationDescriptor::from_json(&read_input(operation)?) {
        Ok(descriptor) => replicator.replicate(&descriptor, &targets).await,
        Err(
            ref e @ Error::UnsupportedOperation {
                ref operation,
                ref collection,
            },
        ) => Ok(replicator.reject(operation, collection, &targets, e)),
        Err(e) => {
            tracing::error!("Invalid operation: {}", e);
            Err(e)
        }
    }
}

fn print_run(run: &ReplicationRun, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(run)?);
        }
        OutputFormat::Table => {
            println!();
            println!(
                "Run {} ({} on '{}', started {})",
                run.run_id,
                run.operation,
                run.collection,
                run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!();
            print!("{}", render_outcomes(&run.outcomes));
            println!();
            print!("{}", render_summary(&run.report));
        }
    }
    Ok(())
}

/// Show the batch plan
fn run_plan(config: &MirrorConfig, targets: Option<&str>) -> Result<()> {
    let targets = resolve_targets(config, targets)?;
    let replicator = Replicator::new(config, Arc::new(StoreConnector::new(config)));
    let batches = replicator.plan(&targets);

    println!("Replication Plan");
    println!("================");
    println!(
        "Targets: {}  |  Max concurrent: {}  |  Batches: {}",
        targets.len(),
        replicator.scheduler().limit(),
        batches.len()
    );
    println!();

    for (index, batch) in batches.iter().enumerate() {
        println!("Batch {}/{}", index + 1, batches.len());
        for target in batch {
            match replicator.registry().resolve(target) {
                Some(endpoint) => println!("  {:<16} {}", target, endpoint.redacted()),
                None => println!("  {:<16} NOT CONFIGURED", target),
            }
        }
    }

    Ok(())
}

/// Validate configuration file
fn run_validate(path: &Path, config: MirrorConfig) -> Result<()> {
    println!("✓ Configuration is valid: {}", path.display());
    println!("  Database:        {}", config.replication.database);
    println!("  Max Concurrent:  {}", config.replication.max_concurrent);
    println!("  Connect Timeout: {} ms", config.replication.connect_timeout_ms);
    println!("  Sanitized Fields: {:?}", config.sanitize.fields);
    println!("  Replicas:        {}", config.replicas.len());
    for (id, url) in &config.replicas {
        let endpoint = wolfmirror::store::Endpoint::new(ReplicaTarget::new(id.clone()), url.clone());
        println!("    {:<14} {}", id, endpoint.redacted());
    }
    Ok(())
}

/// Write a sample configuration file
fn run_init(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            output.display()
        )));
    }

    std::fs::write(output, MirrorConfig::sample())?;
    println!("Configuration written to {}", output.display());
    Ok(())
}
