//! Owns the job lifecycle: admission, claiming, dispatch, settlement.
//!
//! Workers only read; every ledger transition, dedup-index write and
//! payload move happens here, on the processor thread. Settlement order
//! is deliberate: the dedup index is written before the job is marked
//! succeeded, so a crash between the two turns the re-attempt into a
//! duplicate hit instead of a second load.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::Config;
use crate::db::{dedup_repo, job_repo, Database, Loader};
use crate::error::{Result, WorkerError};
use crate::queue::attempt::{backoff_delay, AttemptContext, AttemptOutcome, AttemptReport};
use crate::queue::gate::KeyGate;
use crate::queue::job::{Job, JobState};
use crate::queue::pool::WorkerPool;
use crate::storage::PayloadStore;

/// How long the drain loop sleeps while waiting out retry backoff.
const DRAIN_TICK: Duration = Duration::from_millis(200);
/// Granularity of the daemon poll sleep, so shutdown stays responsive.
const POLL_TICK: Duration = Duration::from_millis(500);

/// Outcome tally of one drain cycle.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub succeeded: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub failed: u64,
    /// Jobs still non-terminal when the drain stopped. Zero unless the
    /// drain was interrupted by shutdown.
    pub remaining: u64,
}

impl DrainReport {
    pub fn is_drained(&self) -> bool {
        self.remaining == 0
    }
}

pub struct QueueProcessor {
    db: Database,
    store: PayloadStore,
    pool: WorkerPool,
    config: Config,
}

impl QueueProcessor {
    pub fn new(db: Database, config: &Config) -> Self {
        let ctx = Arc::new(AttemptContext {
            db: db.clone(),
            loader: Loader::new(db.clone(), config.database.clone()),
            gate: KeyGate::new(),
            config: config.database.clone(),
        });
        let pool = WorkerPool::new(ctx, config.queue.max_workers);

        Self {
            store: PayloadStore::new(&config.storage),
            db,
            pool,
            config: config.clone(),
        }
    }

    /// Admission contract: the payload is durably written to `pending/`
    /// and a ledger row exists before this returns the job id. A crash
    /// after this point can delay the job but never lose it.
    pub fn admit(&self, attachment_name: &str, source_ref: &str, bytes: &[u8]) -> Result<String> {
        let payload_path = self.store.write_pending(attachment_name, bytes)?;
        self.enqueue(source_ref, &payload_path)
    }

    /// Enqueues a job for a payload already sitting in `pending/`.
    pub fn enqueue(&self, source_ref: &str, payload_path: &Path) -> Result<String> {
        let now = Utc::now().to_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();
        job_repo::insert(
            &self.db,
            &job_repo::JobRow {
                id: id.clone(),
                source_ref: source_ref.to_string(),
                payload_path: payload_path.to_string_lossy().into_owned(),
                content_hash: None,
                state: JobState::Pending.as_str().to_string(),
                attempt_count: 0,
                next_attempt_at: None,
                last_error: None,
                warnings: None,
                records_loaded: None,
                created_at: now.clone(),
                updated_at: now,
            },
        )?;

        log::info!("Enqueued job {} for {}", id, source_ref);
        Ok(id)
    }

    /// Startup recovery: jobs interrupted mid-attempt by a crash go back
    /// to `retrying` and run again. Returns how many were recovered.
    pub fn recover(&self) -> Result<u64> {
        let recovered = job_repo::recover_interrupted(&self.db, &Utc::now().to_rfc3339())?;
        if recovered > 0 {
            log::warn!("Recovered {} jobs interrupted by a previous run", recovered);
        }
        Ok(recovered)
    }

    /// Drains the queue completely, waiting out retry backoff as needed.
    pub fn run_once(&self) -> Result<DrainReport> {
        self.drain(None)
    }

    /// Daemon loop: drain, sweep retention, sleep the poll interval,
    /// repeat until the shutdown flag is set.
    pub fn run_forever(&self, shutdown: &AtomicBool) -> Result<()> {
        log::info!(
            "Queue processor running (poll interval {}s)",
            self.config.queue.poll_interval_secs
        );

        while !shutdown.load(Ordering::Relaxed) {
            let report = self.drain(Some(shutdown))?;
            log::info!(
                "Drain cycle: {} succeeded, {} duplicates, {} retried, {} failed",
                report.succeeded,
                report.duplicates,
                report.retried,
                report.failed
            );

            if let Err(e) = self
                .store
                .sweep_processed(self.config.storage.retention_days)
            {
                log::warn!("Retention sweep failed: {}", e);
            }

            let interval = Duration::from_secs(self.config.queue.poll_interval_secs);
            let mut waited = Duration::ZERO;
            while waited < interval && !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(POLL_TICK);
                waited += POLL_TICK;
            }
        }

        log::info!("Queue processor stopping");
        Ok(())
    }

    /// Stops the workers and leaves any unfinished jobs claimable.
    pub fn stop(self) -> Result<()> {
        self.pool.shutdown();
        while let Some(report) = self.pool.try_recv_report() {
            let mut tally = DrainReport::default();
            self.settle(report, &mut tally)?;
        }
        self.pool.wait();

        let released = job_repo::recover_interrupted(&self.db, &Utc::now().to_rfc3339())?;
        if released > 0 {
            log::info!("{} in-flight jobs left in retrying for the next run", released);
        }
        Ok(())
    }

    fn drain(&self, shutdown: Option<&AtomicBool>) -> Result<DrainReport> {
        let stop = || shutdown.is_some_and(|flag| flag.load(Ordering::Relaxed));
        let mut tally = DrainReport::default();

        loop {
            if stop() {
                break;
            }

            let now = Utc::now().to_rfc3339();
            let due = job_repo::due_jobs(&self.db, &now, self.config.queue.max_workers as u64)?;

            if due.is_empty() {
                if job_repo::nonterminal_count(&self.db)? == 0 {
                    break;
                }
                // Jobs exist but none is due: backoff has not elapsed.
                std::thread::sleep(DRAIN_TICK);
                continue;
            }

            let mut in_flight = 0;
            for row in due {
                match job_repo::claim(&self.db, &row.id, &now)? {
                    Some(claimed) => {
                        self.pool.submit(Job::from_row(&claimed))?;
                        in_flight += 1;
                    }
                    None => continue,
                }
            }

            for _ in 0..in_flight {
                let report = self.pool.recv_report().ok_or(WorkerError::ChannelClosed)?;
                self.settle(report, &mut tally)?;
            }
        }

        tally.remaining = job_repo::nonterminal_count(&self.db)?;
        Ok(tally)
    }

    /// Applies one attempt report to the ledger, the dedup index and the
    /// payload areas. A failure to archive a payload never escapes as a
    /// processor error; it is settled like any transient attempt failure
    /// so the drain keeps going.
    fn settle(&self, report: AttemptReport, tally: &mut DrainReport) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        let Some(row) = job_repo::find_by_id(&self.db, &report.job_id)? else {
            log::error!("Report for unknown job {}", report.job_id);
            return Ok(());
        };
        if JobState::parse(&row.state) != Some(JobState::Processing) {
            log::error!(
                "Report for job {} in unexpected state '{}', ignoring",
                row.id,
                row.state
            );
            return Ok(());
        }

        if let Some(hash) = &report.content_hash {
            job_repo::set_content_hash(&self.db, &row.id, hash)?;
        }

        match report.outcome {
            Ok(AttemptOutcome::Loaded {
                records_loaded,
                keys,
                warnings,
            }) => {
                if let Some(hash) = &report.content_hash {
                    dedup_repo::record_file(
                        &self.db,
                        &dedup_repo::FileEntry {
                            content_hash: hash.clone(),
                            job_id: row.id.clone(),
                            outcome: "loaded".to_string(),
                            committed_at: now.clone(),
                        },
                    )?;
                }
                dedup_repo::record_keys(&self.db, &keys, &now)?;

                match self.archive_payload(&row.payload_path, false) {
                    Ok(archived) => {
                        job_repo::mark_succeeded(
                            &self.db,
                            &row.id,
                            records_loaded,
                            &archived,
                            warnings.as_deref(),
                            &now,
                        )?;
                        log::info!(
                            "Job {} loaded {} records from {}",
                            row.id,
                            records_loaded,
                            row.source_ref
                        );
                        tally.succeeded += 1;
                    }
                    // The load is committed and in the dedup index; the
                    // re-attempt converges and only redoes the archival.
                    Err(e) => self.settle_transient(
                        &row,
                        &format!("failed to archive payload: {}", e),
                        tally,
                        &now,
                    )?,
                }
            }
            Ok(AttemptOutcome::Duplicate { original_job_id }) => {
                match self.archive_payload(&row.payload_path, false) {
                    Ok(archived) => {
                        job_repo::mark_succeeded(&self.db, &row.id, 0, &archived, None, &now)?;
                        log::info!(
                            "Job {} is a duplicate of {} ({}), no records loaded",
                            row.id,
                            original_job_id,
                            row.source_ref
                        );
                        tally.duplicates += 1;
                    }
                    Err(e) => self.settle_transient(
                        &row,
                        &format!("failed to archive payload: {}", e),
                        tally,
                        &now,
                    )?,
                }
            }
            Err(e) if e.is_transient() => {
                self.settle_transient(&row, e.message(), tally, &now)?;
            }
            Err(e) => {
                self.settle_failed(&row, e.message(), tally, &now)?;
            }
        }

        Ok(())
    }

    /// Transient failure: schedule a re-attempt with backoff, or fail the
    /// job once the retry ceiling is reached.
    fn settle_transient(
        &self,
        row: &job_repo::JobRow,
        message: &str,
        tally: &mut DrainReport,
        now: &str,
    ) -> Result<()> {
        if row.attempt_count < self.config.queue.max_retries {
            let delay = backoff_delay(row.attempt_count);
            let next_attempt_at =
                (Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64)).to_rfc3339();
            job_repo::mark_retrying(&self.db, &row.id, message, &next_attempt_at, now)?;
            log::warn!(
                "Job {} attempt {} failed ({}), retrying in {}s",
                row.id,
                row.attempt_count,
                message,
                delay.as_secs()
            );
            tally.retried += 1;
            Ok(())
        } else {
            self.settle_failed(row, &format!("{} (retry limit reached)", message), tally, now)
        }
    }

    /// Terminal failure: dead-letter the payload and record the error.
    /// When even the dead-letter move fails, the payload stays where it
    /// is and its recorded path still points at it.
    fn settle_failed(
        &self,
        row: &job_repo::JobRow,
        message: &str,
        tally: &mut DrainReport,
        now: &str,
    ) -> Result<()> {
        let archived = match self.archive_payload(&row.payload_path, true) {
            Ok(path) => path,
            Err(e) => {
                log::warn!(
                    "Job {}: payload left at {}: {}",
                    row.id,
                    row.payload_path,
                    e
                );
                row.payload_path.clone()
            }
        };
        job_repo::mark_failed(&self.db, &row.id, message, &archived, now)?;
        log::error!("Job {} failed permanently: {}", row.id, message);
        tally.failed += 1;
        Ok(())
    }

    /// Moves a terminal payload out of `pending/`. A payload already gone
    /// (archived by a crashed earlier attempt) keeps its recorded path.
    fn archive_payload(&self, payload_path: &str, to_errors: bool) -> Result<String> {
        let path = Path::new(payload_path);
        if !path.exists() {
            return Ok(payload_path.to_string());
        }
        let archived = if to_errors {
            self.store.move_to_errors(path)?
        } else {
            self.store.move_to_processed(path)?
        };
        Ok(archived.to_string_lossy().into_owned())
    }
}
