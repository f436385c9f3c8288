//! migrate-db CLI - resumable SQL Server to PostgreSQL data migration.

use clap::{Parser, Subcommand};
use migrate_db::{Config, MigrateError, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "migrate-db")]
#[command(about = "Resumable SQL Server to PostgreSQL data migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "migrate.yaml", global = true)]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long, global = true)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text", global = true)]
    log_format: String,

    /// Log verbosity: debug, info, warn, error (RUST_LOG takes precedence)
    #[arg(long, default_value = "info", global = true)]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration, resuming from the checkpoint if one exists
    Run,

    /// Re-add foreign keys from a pending restore script
    Restore,

    /// Show checkpointed tables and any pending restore script
    Status,

    /// Test database connections
    HealthCheck,

    /// Write a starter configuration file
    Init {
        /// Output path for configuration file [default: migrate.yaml]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    // Handle init command separately (doesn't need existing config)
    if let Commands::Init { output, force } = cli.command {
        let output_path = output.unwrap_or_else(|| PathBuf::from("migrate.yaml"));
        return write_template(&output_path, force);
    }

    setup_logging(&cli.verbosity, &cli.log_format).map_err(MigrateError::Config)?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);
    let orchestrator = Orchestrator::from_config(&config)?;

    match cli.command {
        Commands::Init { .. } => unreachable!(), // Handled above

        Commands::Run => {
            let result = orchestrator.run().await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nMigration completed!");
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!(
                    "  Tables: {} transferred, {} already done, {} ignored ({} total)",
                    result.tables_transferred,
                    result.tables_skipped,
                    result.tables_ignored,
                    result.tables_total
                );
                println!("  Rows: {}", result.rows_transferred);
                println!(
                    "  Foreign keys: {} suspended, {} restored",
                    result.foreign_keys_suspended, result.constraints_restored
                );
            }
        }

        Commands::Restore => {
            let restored = orchestrator.restore_constraints().await?;

            if cli.output_json {
                println!("{}", serde_json::json!({ "constraints_restored": restored }));
            } else if restored == 0 {
                println!("No restore script pending");
            } else {
                println!("Restored {} foreign keys", restored);
            }
        }

        Commands::Status => {
            let state = orchestrator.resume_state().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                println!("Checkpoint ({}):", state.checkpoint_location);
                if state.checkpointed_tables.is_empty() {
                    println!("  no tables recorded");
                }
                for table in &state.checkpointed_tables {
                    println!("  {}", table);
                }
                println!(
                    "Restore script ({}): {}",
                    state.script_location,
                    if state.restore_script_pending { "pending" } else { "none" }
                );
            }
        }

        Commands::HealthCheck => {
            let result = orchestrator.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                for health in [&result.source, &result.target] {
                    println!(
                        "  {}: {} ({}ms)",
                        health.engine,
                        if health.connected { "OK" } else { "FAILED" },
                        health.latency_ms
                    );
                    if let Some(ref err) = health.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::pool(
                    "Health check failed",
                    "one or more databases are unreachable",
                ));
            }
        }
    }

    Ok(())
}

fn write_template(path: &PathBuf, force: bool) -> Result<(), MigrateError> {
    if path.exists() && !force {
        return Err(MigrateError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    std::fs::write(path, Config::template())?;
    println!("Wrote configuration template to {}", path.display());
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" | "info" | "warn" | "error" | "trace" => verbosity.to_lowercase(),
        other => return Err(format!("unknown verbosity '{}'", other)),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}
