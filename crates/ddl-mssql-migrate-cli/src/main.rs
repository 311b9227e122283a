//! ddl-mssql-migrate CLI - translate MySQL/PostgreSQL DDL to MSSQL and move the data.

use clap::{Parser, Subcommand, ValueEnum};
use ddl_mssql_migrate::conflict::{blocking_summary, has_blocking, ConflictRecord, ConflictResolver};
use ddl_mssql_migrate::{
    Config, MigrateError, MigrationResult, Orchestrator, RunOptions, SchemaDocument,
    TranslationEngine,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "ddl-mssql-migrate")]
#[command(about = "Translate MySQL/PostgreSQL DDL to MSSQL and migrate the data")]
#[command(version)]
struct Cli {
    /// Output JSON result to stdout
    #[arg(long, global = true)]
    output_json: bool,

    /// Log format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info", global = true)]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate DDL to MSSQL without touching any database
    Translate {
        /// Source DDL file (MySQL or PostgreSQL)
        input: Option<PathBuf>,

        /// Write the translated DDL here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Configuration file supplying extra translation rules
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Translate DDL and report conflicts with the target schema
    Check {
        /// Source DDL file (MySQL or PostgreSQL)
        input: Option<PathBuf>,

        /// Existing MSSQL DDL to compare against
        #[arg(long)]
        target_schema: Option<PathBuf>,

        /// Configuration file supplying rules and renames
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Translate, provision the target and migrate the data
    Migrate {
        /// Source DDL file (MySQL or PostgreSQL)
        input: Option<PathBuf>,

        /// Path to YAML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Only copy rows modified since the last run
        #[arg(long)]
        incremental: bool,

        /// Stop after the conflict check and print the translated DDL
        #[arg(long)]
        dry_run: bool,

        /// Register the configured recurring job after the data work
        #[arg(long)]
        schedule: bool,
    },

    /// Register the configured recurring job only
    Schedule {
        /// Path to YAML configuration file
        #[arg(short, long)]
        config: PathBuf,
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
    setup_logging(&cli.verbosity, cli.log_format);

    match cli.command {
        Commands::Translate {
            input,
            output,
            config,
        } => {
            let engine = match config {
                Some(path) => TranslationEngine::from_config(&load_config(&path)?.translation)?,
                None => TranslationEngine::mssql()?,
            };
            let source = load_input(input)?;
            let (translated, report) = engine.translate_with_report(&source);

            match output {
                Some(path) => {
                    std::fs::write(&path, translated.text())
                        .map_err(|e| MigrateError::file_access(&path, e))?;
                    info!("Wrote translated DDL to {:?}", path);
                }
                None if !cli.output_json => println!("{}", translated.text()),
                None => {}
            }
            if cli.output_json {
                let value = serde_json::json!({
                    "input": source.display_name(),
                    "statements": report.statements,
                    "rules": report.rules,
                    "ddl": translated.text(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
        }

        Commands::Check {
            input,
            target_schema,
            config,
        } => {
            let source = load_input(input)?;
            let (translated, conflicts) = match config {
                Some(path) => {
                    let mut config = load_config(&path)?;
                    if target_schema.is_some() {
                        config.conflicts.target_schema_file = target_schema;
                    }
                    Orchestrator::new(config).check(&source)?
                }
                None => {
                    let engine = TranslationEngine::mssql()?;
                    let translated = engine.translate(&source);
                    let target = match &target_schema {
                        Some(path) => SchemaDocument::load(path)?,
                        None => translated.clone(),
                    };
                    let conflicts = ConflictResolver::new(engine, &BTreeMap::new())
                        .find_conflicts(&source, &target);
                    (translated, conflicts)
                }
            };

            if cli.output_json {
                let value = serde_json::json!({
                    "input": source.display_name(),
                    "statements": translated.statements().len(),
                    "conflicts": conflicts,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print_conflicts(&conflicts);
            }

            if has_blocking(&conflicts) {
                return Err(MigrateError::Conflict {
                    count: conflicts.iter().filter(|c| c.is_blocking()).count(),
                    details: blocking_summary(&conflicts),
                });
            }
        }

        Commands::Migrate {
            input,
            config,
            incremental,
            dry_run,
            schedule,
        } => {
            let config = load_config(&config)?;
            let source = load_input(input)?;
            let cancel_token = setup_signal_handler();

            let options = RunOptions {
                dry_run,
                incremental,
                schedule,
            };
            let result = Orchestrator::new(config)
                .run(&source, &options, cancel_token)
                .await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_result(&result);
            }
        }

        Commands::Schedule { config } => {
            let config = load_config(&config)?;
            let request = Orchestrator::new(config).register_schedule().await?;
            if cli.output_json {
                let value = serde_json::json!({
                    "cron": request.cron_expression(),
                    "command": request.command(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Registered: {}", request.crontab_line());
            }
        }
    }

    Ok(())
}

/// Missing input is a fatal error (exit 1), not a usage error.
fn load_input(input: Option<PathBuf>) -> Result<SchemaDocument, MigrateError> {
    let path = input.ok_or_else(|| {
        MigrateError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "no input DDL file given",
        ))
    })?;
    SchemaDocument::load(path)
}

fn load_config(path: &Path) -> Result<Config, MigrateError> {
    let config = Config::load(path)?;
    info!("Loaded configuration from {:?}", path);
    Ok(config)
}

fn print_conflicts(conflicts: &[ConflictRecord]) {
    if conflicts.is_empty() {
        println!("No conflicts found");
        return;
    }
    println!("Conflicts:");
    for record in conflicts {
        let marker = if record.is_blocking() { "✗" } else { "✓" };
        println!("  {} {}", marker, record);
    }
}

fn print_result(result: &MigrationResult) {
    if let Some(ddl) = &result.translated_ddl {
        println!("{}", ddl);
        println!("\nDry run completed!");
        print_conflicts(&result.conflicts);
        return;
    }

    println!("\nMigration completed!");
    println!("  Run ID: {}", result.run_id);
    println!("  Mode: {:?}", result.mode);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Tables: {}", result.tables.len());
    println!("  Rows: {}", result.rows_transferred);
    let already_present: u64 = result.tables.iter().map(|t| t.rows_already_present).sum();
    if already_present > 0 {
        println!("  Already present: {}", already_present);
    }
    if result.rows_failed > 0 {
        println!("  Failed rows: {}", result.rows_failed);
        for table in result.tables.iter().filter(|t| t.rows_failed > 0) {
            println!("    {}: {}", table.table, table.rows_failed);
            for failure in &table.failures {
                println!(
                    "      row {} ({}): {}",
                    failure.row_number,
                    failure.reason.as_str(),
                    failure.message
                );
            }
        }
    }
    if result.scheduled {
        println!("  Recurring run registered");
    }
}

fn setup_logging(verbosity: &str, format: LogFormat) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries results, so logs go to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
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
                    eprintln!("\nReceived {}. Shutting down gracefully...", name);
                    token.cancel();
                });
            }
            Err(e) => eprintln!("Cannot install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    cancel_token
}
