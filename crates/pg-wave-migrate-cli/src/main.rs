//! pg-wave-migrate CLI - foreign-key aware PostgreSQL table migration.

use clap::{Parser, Subcommand};
use pg_wave_migrate::{health_check, Config, MigrateError, MigrationResult, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pg-wave-migrate")]
#[command(about = "Foreign-key aware PostgreSQL to PostgreSQL table migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source connection string (overrides the config file)
    #[arg(long, env = "PGWAVE_SOURCE_URL", hide_env_values = true)]
    source_url: Option<String>,

    /// Target connection string (overrides the config file)
    #[arg(long, env = "PGWAVE_TARGET_URL", hide_env_values = true)]
    target_url: Option<String>,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
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
    /// Start a new migration
    Run {
        /// Override number of concurrent table jobs
        #[arg(long)]
        workers: Option<usize>,

        /// Override per-wave timeout in seconds
        #[arg(long)]
        wave_timeout: Option<u64>,

        /// Dry run: discover tables and show the wave plan without migrating
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a previously interrupted or failed migration
    Resume {
        /// Override number of concurrent table jobs
        #[arg(long)]
        workers: Option<usize>,

        /// Override per-wave timeout in seconds
        #[arg(long)]
        wave_timeout: Option<u64>,
    },

    /// Check which source tables exist on the target
    Validate,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::load(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => Config::default(),
    };
    if let Some(url) = &cli.source_url {
        config.source.url = url.clone();
    }
    if let Some(url) = &cli.target_url {
        config.target.url = url.clone();
    }

    match cli.command {
        Commands::Run {
            workers,
            wave_timeout,
            dry_run,
        } => {
            apply_overrides(&mut config, workers, wave_timeout);
            config.validate()?;

            // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
            let cancel_token = setup_signal_handler();

            let mut orchestrator = Orchestrator::new(config).await?;

            // Apply global state_file if provided
            if let Some(ref path) = cli.state_file {
                orchestrator = orchestrator.with_state_file(path.clone());
            }

            let result = orchestrator.run(cancel_token, dry_run).await?;
            print_result(&result, cli.output_json, dry_run)?;
        }

        Commands::Resume {
            workers,
            wave_timeout,
        } => {
            // State file is required for resume
            let state_file = cli.state_file.ok_or_else(|| {
                MigrateError::Config("--state-file is required for resume".to_string())
            })?;

            if !state_file.exists() {
                return Err(MigrateError::Config(format!(
                    "State file not found: {:?}",
                    state_file
                )));
            }

            apply_overrides(&mut config, workers, wave_timeout);
            config.validate()?;

            let cancel_token = setup_signal_handler();

            let orchestrator = Orchestrator::new(config)
                .await?
                .with_state_file(state_file)
                .resume()?;

            let result = orchestrator.run(cancel_token, false).await?;
            print_result(&result, cli.output_json, false)?;
        }

        Commands::Validate => {
            config.validate()?;
            let orchestrator = Orchestrator::new(config).await?;
            let report = orchestrator.validate().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Validation Results:");
                println!("  Present on target: {}", report.present.len());
                for table in &report.missing {
                    println!("  Missing: {}", table);
                }
            }

            if !report.is_complete() {
                return Err(MigrateError::Metadata(format!(
                    "{} table(s) missing on target",
                    report.missing.len()
                )));
            }
        }

        Commands::HealthCheck => {
            config.validate()?;
            let result = health_check(&config).await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                for (name, endpoint) in [("Source", &result.source), ("Target", &result.target)] {
                    println!(
                        "  {}: {} ({}ms)",
                        name,
                        if endpoint.connected { "OK" } else { "FAILED" },
                        endpoint.latency_ms
                    );
                    if let Some(ref description) = endpoint.description {
                        println!("    {}", description);
                    }
                    if let Some(ref err) = endpoint.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                let (endpoint, health) = if result.source.connected {
                    ("target", &result.target)
                } else {
                    ("source", &result.source)
                };
                return Err(MigrateError::connectivity(
                    endpoint,
                    health.error.clone().unwrap_or_default(),
                ));
            }
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, workers: Option<usize>, wave_timeout: Option<u64>) {
    if let Some(w) = workers {
        config.migration.workers = Some(w);
    }
    if let Some(secs) = wave_timeout {
        config.migration.wave_timeout_secs = Some(secs);
    }
}

fn print_result(result: &MigrationResult, json: bool, dry_run: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", result.to_json()?);
        return Ok(());
    }

    if dry_run {
        println!("\nDry run: {} table(s) in {} wave(s)", result.tables_total, result.waves_total);
        for wave in &result.waves {
            println!(
                "  Wave {}: {}",
                wave.number,
                wave.tables.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }
    } else {
        println!("\nMigration completed in {:.2}s", result.duration_seconds);
        println!("  Run ID: {}", result.run_id);
        println!(
            "  Tables: {} migrated, {} skipped, {} total",
            result.tables_migrated, result.tables_skipped, result.tables_total
        );
        println!("  Waves: {}/{}", result.waves_completed, result.waves_total);
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("invalid verbosity '{}'", other)),
    };

    // RUST_LOG wins over --verbosity when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("invalid log format '{}' (expected text or json)", other)),
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Stopping running dump/restore jobs...", name);
                    token.cancel();
                });
            }
            Err(e) => warn!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Stopping running dump/restore jobs...");
                token.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    cancel_token
}
