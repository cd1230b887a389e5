//! Entry points behind the CLI commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::db::{dedup_repo, job_repo, Database};
use crate::error::{Result, WorkerError};
use crate::queue::{JobState, QueueProcessor};

/// Daemon mode: recover interrupted work, then poll and drain until a
/// shutdown signal arrives.
pub fn run(config: &Config) -> Result<()> {
    let processor = start(config)?;
    processor.recover()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        log::info!("Shutdown signal received");
        flag.store(true, Ordering::Relaxed);
    })
    .map_err(|e| WorkerError::SignalHandler(e.to_string()))?;

    processor.run_forever(&shutdown)?;
    processor.stop()
}

/// Single drain: recover, process everything currently queued (waiting
/// out retry backoff), exit. Returns whether the queue fully drained.
pub fn run_once(config: &Config) -> Result<bool> {
    let processor = start(config)?;
    processor.recover()?;

    let report = processor.run_once()?;
    log::info!(
        "Drained: {} succeeded, {} duplicates, {} failed, {} remaining",
        report.succeeded,
        report.duplicates,
        report.failed,
        report.remaining
    );
    let drained = report.is_drained();
    processor.stop()?;
    Ok(drained)
}

/// Verifies configuration, storage areas and database reachability
/// without touching any job.
pub fn test_config(config: &Config) -> Result<()> {
    config.validate()?;
    config.ensure_directories()?;

    let db = Database::open(&config.database.path)?;
    db.ping()?;

    println!("Configuration OK");
    println!("  database:      {}", config.database.path.display());
    println!("  target table:  {}", config.database.target_table);
    println!("  unique key:    {}", config.database.unique_key);
    println!("  columns:       {}", config.database.columns.join(", "));
    println!("  pending dir:   {}", config.storage.pending_dir.display());
    println!("  max workers:   {}", config.queue.max_workers);
    println!("  max retries:   {}", config.queue.max_retries);
    Ok(())
}

/// Prints per-state job counts, the backlog and the size of the dedup
/// index.
pub fn status(config: &Config) -> Result<()> {
    let db = Database::open(&config.database.path)?;

    println!("Job ledger:");
    let mut backlog: u64 = 0;
    for state in JobState::ALL {
        let count = job_repo::count_by_state(&db, state.as_str())?;
        if !state.is_terminal() {
            backlog += count;
        }
        println!("  {:<12} {}", state, count);
    }
    println!("Backlog:         {}", backlog);
    println!("Processed files: {}", dedup_repo::count_files(&db)?);

    let (key_count, last_commit) = dedup_repo::keys_summary(&db)?;
    match last_commit {
        Some(at) => println!("Committed keys:  {} (latest {})", key_count, at),
        None => println!("Committed keys:  0"),
    }
    Ok(())
}

fn start(config: &Config) -> Result<QueueProcessor> {
    config.ensure_directories()?;
    let db = Database::open(&config.database.path)?;
    Ok(QueueProcessor::new(db, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use tempfile::TempDir;

    use crate::config::{DatabaseConfig, QueueConfig, StorageConfig};

    fn test_config_at(root: &Path) -> Config {
        Config {
            database: DatabaseConfig {
                path: root.join("waybill.db"),
                staging_prefix: "staging".to_string(),
                target_table: "tracking_data".to_string(),
                unique_key: "hawb".to_string(),
                columns: vec![
                    "hawb".to_string(),
                    "carrier".to_string(),
                    "status".to_string(),
                ],
            },
            storage: StorageConfig {
                pending_dir: root.join("pending"),
                processed_dir: root.join("processed"),
                errors_dir: root.join("errors"),
                retention_days: 30,
            },
            queue: QueueConfig {
                max_workers: 1,
                max_retries: 3,
                poll_interval_secs: 3600,
            },
        }
    }

    #[test]
    fn test_run_once_empty_queue_drains() {
        let temp = TempDir::new().unwrap();
        let config = test_config_at(temp.path());
        assert!(run_once(&config).unwrap());
    }

    #[test]
    fn test_config_check_creates_directories() {
        let temp = TempDir::new().unwrap();
        let config = test_config_at(temp.path());
        test_config(&config).unwrap();

        assert!(config.storage.pending_dir.exists());
        assert!(config.storage.processed_dir.exists());
        assert!(config.storage.errors_dir.exists());
        assert!(config.database.path.exists());
    }

    #[test]
    fn test_status_on_fresh_database() {
        let temp = TempDir::new().unwrap();
        let config = test_config_at(temp.path());
        status(&config).unwrap();
    }

    #[test]
    fn test_status_with_queued_work() {
        let temp = TempDir::new().unwrap();
        let config = test_config_at(temp.path());

        let processor = start(&config).unwrap();
        processor
            .admit("a.xlsx", "msg-1/a.xlsx", b"payload")
            .unwrap();
        processor.stop().unwrap();

        status(&config).unwrap();
    }
}
