//! One processing attempt, run on a worker thread.
//!
//! The pipeline is read payload, fingerprint, dedup check, parse, key
//! claim, load. It only reads the ledger; every ledger transition and
//! payload move happens later, on the processor thread, when the report
//! is settled.

use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::db::{dedup_repo, Database, LoadError, Loader};
use crate::error::ValidationError;
use crate::queue::gate::KeyGate;
use crate::queue::job::Job;
use crate::sheet;

/// Backoff before re-attempting after a transient failure: 2^attempt
/// seconds. The exponent is capped so the shift cannot overflow; the
/// retry ceiling hits long before the cap does.
pub fn backoff_delay(attempt_count: u32) -> Duration {
    Duration::from_secs(1u64 << attempt_count.min(20))
}

/// How one attempt ended, short of an error.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The batch was committed to the target table.
    Loaded {
        records_loaded: u64,
        keys: Vec<String>,
        warnings: Option<String>,
    },
    /// Identical bytes were already fully processed by an earlier job.
    /// No target-table effect; the job still completes successfully.
    Duplicate { original_job_id: String },
}

/// An attempt failure carrying its retry classification.
#[derive(Debug)]
pub enum AttemptError {
    /// Worth re-attempting after backoff.
    Transient(String),
    /// Will fail identically every time; the job should go to `failed`.
    Permanent(String),
}

impl AttemptError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AttemptError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            AttemptError::Transient(m) | AttemptError::Permanent(m) => m,
        }
    }
}

impl From<ValidationError> for AttemptError {
    fn from(e: ValidationError) -> Self {
        // Bad bytes do not get better on retry.
        AttemptError::Permanent(e.to_string())
    }
}

impl From<LoadError> for AttemptError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::Transient(m) => AttemptError::Transient(m),
            LoadError::Permanent(m) => AttemptError::Permanent(m),
        }
    }
}

impl From<crate::db::DatabaseError> for AttemptError {
    fn from(e: crate::db::DatabaseError) -> Self {
        LoadError::from(e).into()
    }
}

/// What a worker sends back to the processor for settlement.
#[derive(Debug)]
pub struct AttemptReport {
    pub job_id: String,
    /// Fingerprint of the payload, when the attempt got far enough to
    /// compute (or inherit) one.
    pub content_hash: Option<String>,
    pub outcome: Result<AttemptOutcome, AttemptError>,
}

/// Shared, thread-safe state the attempt pipeline needs.
pub struct AttemptContext {
    pub db: Database,
    pub loader: Loader,
    pub gate: KeyGate,
    pub config: DatabaseConfig,
}

pub fn run_attempt(ctx: &AttemptContext, job: &Job) -> AttemptReport {
    let mut content_hash = job.content_hash.clone();
    let outcome = run_pipeline(ctx, job, &mut content_hash);
    AttemptReport {
        job_id: job.id.clone(),
        content_hash,
        outcome,
    }
}

fn run_pipeline(
    ctx: &AttemptContext,
    job: &Job,
    content_hash: &mut Option<String>,
) -> Result<AttemptOutcome, AttemptError> {
    // A retry whose first attempt already recorded the fingerprint can
    // hit the dedup index before touching the payload. This also covers
    // a crash after commit but before the payload was archived.
    if let Some(hash) = content_hash.as_deref() {
        if let Some(entry) = dedup_repo::find_file(&ctx.db, hash)? {
            if entry.job_id != job.id {
                return Ok(AttemptOutcome::Duplicate {
                    original_job_id: entry.job_id,
                });
            }
        }
    }

    let bytes = std::fs::read(&job.payload_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AttemptError::Permanent(format!(
                "payload missing: {}",
                job.payload_path.display()
            ))
        } else {
            AttemptError::Transient(format!(
                "failed to read payload {}: {}",
                job.payload_path.display(),
                e
            ))
        }
    })?;

    let hash = sheet::fingerprint(&bytes);
    *content_hash = Some(hash.clone());

    if let Some(entry) = dedup_repo::find_file(&ctx.db, &hash)? {
        if entry.job_id != job.id {
            log::info!(
                "Job {} is a duplicate of job {} (hash {})",
                job.id,
                entry.job_id,
                &hash[..12]
            );
            return Ok(AttemptOutcome::Duplicate {
                original_job_id: entry.job_id,
            });
        }
    }

    let batch = sheet::parse(&bytes, &ctx.config)?;
    let keys = batch.keys();

    let _lease = ctx.gate.try_claim(&keys).ok_or_else(|| {
        AttemptError::Transient("unique keys held by a concurrent job".to_string())
    })?;

    let records_loaded = ctx
        .loader
        .load(&job.id, &job.source_ref, &batch.records)?;

    let warnings = if batch.warnings.is_empty() {
        None
    } else {
        serde_json::to_string(&batch.warnings).ok()
    };

    Ok(AttemptOutcome::Loaded {
        records_loaded,
        keys,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use crate::sheet::tests::{build_workbook, test_config};

    fn test_ctx() -> AttemptContext {
        let db = Database::open_in_memory().expect("Failed to create test database");
        AttemptContext {
            loader: Loader::new(db.clone(), test_config()),
            gate: KeyGate::new(),
            config: test_config(),
            db,
        }
    }

    fn test_job(id: &str, payload_path: PathBuf) -> Job {
        Job {
            id: id.to_string(),
            source_ref: "msg-1/manifest.xlsx".to_string(),
            payload_path,
            content_hash: None,
            attempt_count: 1,
        }
    }

    fn write_workbook(dir: &TempDir, name: &str, rows: &[&[&str]]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, build_workbook(rows)).unwrap();
        path
    }

    #[test]
    fn test_backoff_delay_doubles() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        // Capped, never panics.
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(1 << 20));
    }

    #[test]
    fn test_successful_attempt() {
        let ctx = test_ctx();
        let dir = TempDir::new().unwrap();
        let payload = write_workbook(
            &dir,
            "a.xlsx",
            &[
                &["HAWB", "Carrier", "Status"],
                &["HAWB001", "X", "in transit"],
            ],
        );

        let report = run_attempt(&ctx, &test_job("job-1", payload));
        assert!(report.content_hash.is_some());
        match report.outcome {
            Ok(AttemptOutcome::Loaded {
                records_loaded,
                keys,
                warnings,
            }) => {
                assert_eq!(records_loaded, 1);
                assert_eq!(keys, vec!["HAWB001"]);
                assert!(warnings.is_none());
            }
            other => panic!("Expected Loaded, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_failure_is_permanent() {
        let ctx = test_ctx();
        let dir = TempDir::new().unwrap();
        let payload = write_workbook(&dir, "bad.xlsx", &[&["Wrong", "Columns"]]);

        let report = run_attempt(&ctx, &test_job("job-1", payload));
        match report.outcome {
            Err(e) => assert!(!e.is_transient(), "got transient: {}", e.message()),
            other => panic!("Expected error, got {:?}", other),
        }
        // The fingerprint is still reported so the ledger can record it.
        assert!(report.content_hash.is_some());
    }

    #[test]
    fn test_missing_payload_is_permanent() {
        let ctx = test_ctx();
        let report = run_attempt(&ctx, &test_job("job-1", PathBuf::from("/nonexistent/x.xlsx")));
        match report.outcome {
            Err(e) => assert!(!e.is_transient()),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_detected_by_recorded_hash() {
        let ctx = test_ctx();
        dedup_repo::record_file(
            &ctx.db,
            &dedup_repo::FileEntry {
                content_hash: "cafe".to_string(),
                job_id: "original".to_string(),
                outcome: "loaded".to_string(),
                committed_at: "2026-01-01T00:00:00+00:00".to_string(),
            },
        )
        .unwrap();

        // Hash known from a prior attempt; the payload does not even exist.
        let mut job = test_job("job-2", PathBuf::from("/gone/x.xlsx"));
        job.content_hash = Some("cafe".to_string());

        let report = run_attempt(&ctx, &job);
        match report.outcome {
            Ok(AttemptOutcome::Duplicate { original_job_id }) => {
                assert_eq!(original_job_id, "original");
            }
            other => panic!("Expected Duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_detected_by_content() {
        let ctx = test_ctx();
        let dir = TempDir::new().unwrap();
        let rows: &[&[&str]] = &[
            &["HAWB", "Carrier", "Status"],
            &["HAWB001", "X", "ok"],
        ];
        let first = write_workbook(&dir, "a.xlsx", rows);
        let second = write_workbook(&dir, "b.xlsx", rows);

        let report = run_attempt(&ctx, &test_job("job-1", first));
        let hash = report.content_hash.clone().unwrap();
        assert!(report.outcome.is_ok());
        dedup_repo::record_file(
            &ctx.db,
            &dedup_repo::FileEntry {
                content_hash: hash,
                job_id: "job-1".to_string(),
                outcome: "loaded".to_string(),
                committed_at: "2026-01-01T00:00:00+00:00".to_string(),
            },
        )
        .unwrap();

        // Same bytes under a different name: duplicate.
        let report = run_attempt(&ctx, &test_job("job-2", second));
        assert!(matches!(
            report.outcome,
            Ok(AttemptOutcome::Duplicate { .. })
        ));
    }

    #[test]
    fn test_own_dedup_entry_is_not_a_duplicate() {
        // A crash after dedup commit but before settlement leaves the
        // job's own entry in the index; the retry must not classify the
        // job as a duplicate of itself.
        let ctx = test_ctx();
        let mut job = test_job("job-1", PathBuf::from("/gone/x.xlsx"));
        job.content_hash = Some("cafe".to_string());
        dedup_repo::record_file(
            &ctx.db,
            &dedup_repo::FileEntry {
                content_hash: "cafe".to_string(),
                job_id: "job-1".to_string(),
                outcome: "loaded".to_string(),
                committed_at: "2026-01-01T00:00:00+00:00".to_string(),
            },
        )
        .unwrap();

        // Not a duplicate, so the pipeline proceeds to read the (gone)
        // payload and reports a permanent failure instead.
        let report = run_attempt(&ctx, &job);
        assert!(matches!(report.outcome, Err(AttemptError::Permanent(_))));
    }

    #[test]
    fn test_held_keys_are_a_transient_conflict() {
        let ctx = test_ctx();
        let dir = TempDir::new().unwrap();
        let payload = write_workbook(
            &dir,
            "a.xlsx",
            &[&["HAWB", "Carrier", "Status"], &["HAWB001", "X", "ok"]],
        );

        let _lease = ctx.gate.try_claim(&["HAWB001".to_string()]).unwrap();
        let report = run_attempt(&ctx, &test_job("job-1", payload));
        match report.outcome {
            Err(e) => assert!(e.is_transient()),
            other => panic!("Expected transient conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_warnings_serialized() {
        let ctx = test_ctx();
        let dir = TempDir::new().unwrap();
        let payload = write_workbook(
            &dir,
            "a.xlsx",
            &[
                &["HAWB", "Carrier", "Status"],
                &["HAWB001", "X", "ok"],
                &["", "Y", "ok"],
            ],
        );

        let report = run_attempt(&ctx, &test_job("job-1", payload));
        match report.outcome {
            Ok(AttemptOutcome::Loaded { warnings, .. }) => {
                let json = warnings.expect("warnings should be recorded");
                assert!(json.contains("unique key"));
            }
            other => panic!("Expected Loaded, got {:?}", other),
        }
    }
}
