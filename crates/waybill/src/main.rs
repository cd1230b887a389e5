use clap::{Parser, Subcommand};

use waybill::config::Config;
use waybill::service;

#[derive(Parser)]
#[command(name = "waybill", version, about = "Spreadsheet intake queue with exactly-once loading")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the intake daemon until interrupted
    Run,
    /// Drain the queue once and exit; non-zero if jobs remain
    RunOnce,
    /// Validate configuration, database and storage areas
    TestConfig,
    /// Show job-ledger state counts and dedup-index size
    Status,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Command::Run => service::run(&config).map(|_| true),
        Command::RunOnce => service::run_once(&config),
        Command::TestConfig => service::test_config(&config).map(|_| true),
        Command::Status => service::status(&config).map(|_| true),
    };

    match result {
        Ok(true) => {}
        Ok(false) => {
            log::warn!("Queue not fully drained");
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    // The library logs through `log`; bridge those records into tracing
    // before the subscriber goes live.
    tracing_log::LogTracer::init().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to install tracing subscriber");
    }
}
