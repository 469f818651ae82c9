//! mq-drain CLI - transactional live-broker migration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use mq_drain::client::memory::MemoryConnector;
use mq_drain::client::BrokerConnector;
use mq_drain::{DestinationDirectory, DrainConfig, DrainError, EndpointConfig, Orchestrator};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mq-drain")]
#[command(about = "Transactional live-broker migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source broker URL (falls back to MQ_SOURCE_URL)
    #[arg(long)]
    source_url: Option<String>,

    /// Target broker URL (falls back to MQ_TARGET_URL)
    #[arg(long)]
    target_url: Option<String>,

    /// Also migrate durable topic subscriptions
    #[arg(long)]
    migrate_subscriptions: bool,

    /// Directory for the transaction decision log
    #[arg(long)]
    recovery_dir: Option<PathBuf>,

    /// Output JSON report to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drain the source broker into the target broker
    Run,

    /// Probe connectivity to both brokers
    Check,

    /// List migratable destinations on the source broker
    Discover,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, DrainError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)?;

    let config = resolve_config(&cli)?;
    let connector = connector_for(&config)?;

    match cli.command {
        Commands::Run => {
            let cancel = CancellationToken::new();
            setup_signal_handler(cancel.clone())?;

            let orchestrator = Orchestrator::new(config, connector)
                .await?
                .with_cancellation(cancel);
            let report = orchestrator.run().await?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                println!("\nMigration {}", report.status);
                println!("  Run ID: {}", report.run_id);
                println!("  Duration: {:.2}s", report.duration_seconds);
                println!(
                    "  Destinations: {}/{}",
                    report.destinations_migrated, report.destinations_attempted
                );
                println!("  Messages: {}", report.messages_transferred);
                if !report.failed_destinations.is_empty() {
                    println!("  Failed destinations: {:?}", report.failed_destinations);
                }
            }

            Ok(match report.status.as_str() {
                "completed" | "cancelled" => ExitCode::SUCCESS,
                "connectivity_failed" => ExitCode::from(3),
                _ => ExitCode::from(1),
            })
        }

        Commands::Check => {
            let mut healthy = true;
            for (label, endpoint) in [("source", &config.source), ("target", &config.target)] {
                match connector.connect(endpoint).await {
                    Ok(connection) => {
                        let _ = connection.close().await;
                        println!("{} broker [{}]: ok", label, endpoint.url);
                    }
                    Err(e) => {
                        healthy = false;
                        println!("{} broker [{}]: {}", label, endpoint.url, e);
                    }
                }
            }
            Ok(if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(3)
            })
        }

        Commands::Discover => {
            let directory =
                DestinationDirectory::connect(connector.as_ref(), &config.source).await?;
            for destination in directory.queues().await? {
                println!("queue: {}", destination);
            }
            for destination in directory.durable_subscriptions().await? {
                println!("durable subscription: {}", destination);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Build the effective configuration from file, flags and environment.
///
/// Flags win over the config file; environment variables fill the gaps
/// (`MQ_SOURCE_URL`, `MQ_TARGET_URL`, `MQ_SOURCE_USER`/`MQ_SOURCE_PASSWORD`,
/// `MQ_TARGET_USER`/`MQ_TARGET_PASSWORD`, with `MQ_USER`/`MQ_PASSWORD` as a
/// shared fallback).
fn resolve_config(cli: &Cli) -> Result<DrainConfig, DrainError> {
    let mut config = match &cli.config {
        Some(path) => DrainConfig::load(path)?,
        None => {
            let source_url = cli
                .source_url
                .clone()
                .or_else(|| env_var("MQ_SOURCE_URL"))
                .ok_or_else(|| {
                    DrainError::Config(
                        "missing source broker url (--source-url or MQ_SOURCE_URL)".into(),
                    )
                })?;
            let target_url = cli
                .target_url
                .clone()
                .or_else(|| env_var("MQ_TARGET_URL"))
                .ok_or_else(|| {
                    DrainError::Config(
                        "missing target broker url (--target-url or MQ_TARGET_URL)".into(),
                    )
                })?;
            DrainConfig::new(
                endpoint_from_env(source_url, "MQ_SOURCE_USER", "MQ_SOURCE_PASSWORD"),
                endpoint_from_env(target_url, "MQ_TARGET_USER", "MQ_TARGET_PASSWORD"),
            )
        }
    };

    if let Some(url) = &cli.source_url {
        config.source.url = url.clone();
    }
    if let Some(url) = &cli.target_url {
        config.target.url = url.clone();
    }
    if cli.migrate_subscriptions || env_var("MQ_MIGRATE_SUBSCRIPTIONS").is_some() {
        config.migrate_subscriptions = true;
    }
    if let Some(dir) = &cli.recovery_dir {
        config.recovery.store_dir = dir.clone();
    }

    config.validate()?;
    Ok(config)
}

fn endpoint_from_env(url: String, user_var: &str, password_var: &str) -> EndpointConfig {
    let mut endpoint = EndpointConfig::new(url);
    endpoint.username = env_var(user_var).or_else(|| env_var("MQ_USER"));
    endpoint.password = env_var(password_var).or_else(|| env_var("MQ_PASSWORD"));
    endpoint
}

/// An environment variable, with `__none` treated as unset so a deployment
/// can explicitly blank an inherited value.
fn env_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if value.eq_ignore_ascii_case("__none") => None,
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

/// Pick the driver for the configured URL scheme.
fn connector_for(config: &DrainConfig) -> Result<Arc<dyn BrokerConnector>, DrainError> {
    let scheme = |url: &str| url.split("://").next().unwrap_or(url).to_string();
    let source_scheme = scheme(&config.source.url);
    let target_scheme = scheme(&config.target.url);
    if source_scheme != target_scheme {
        return Err(DrainError::Config(format!(
            "source and target must use the same driver (got '{}' and '{}')",
            source_scheme, target_scheme
        )));
    }
    match source_scheme.as_str() {
        "mem" => Ok(Arc::new(MemoryConnector::with_auto_create())),
        other => Err(DrainError::Config(format!(
            "no broker driver compiled in for scheme '{}' (available: mem)",
            other
        ))),
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), DrainError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(verbosity));

    match format {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(std::io::stderr)
                .init();
        }
        "text" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        other => {
            return Err(DrainError::Config(format!(
                "unknown log format '{}' (expected text or json)",
                other
            )));
        }
    }
    Ok(())
}

/// Cancel the token on SIGINT (and SIGTERM on unix). The orchestrator
/// finishes or rolls back the in-flight destination before the run ends and
/// the final stats are dumped.
fn setup_signal_handler(cancel: CancellationToken) -> Result<(), DrainError> {
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt; finishing the current destination ...");
                cancel.cancel();
            }
        }
    });

    #[cfg(unix)]
    {
        let mut term = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            if term.recv().await.is_some() {
                info!("Received terminate; finishing the current destination ...");
                cancel.cancel();
            }
        });
    }

    Ok(())
}
