//! Job ledger — persistence for every enqueued job and its lifecycle.
//!
//! The queue processor is the only writer of job state. Claiming uses a
//! compare-and-set so two workers can never both believe they own a job.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw job row from the ledger.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub source_ref: String,
    pub payload_path: String,
    pub content_hash: Option<String>,
    pub state: String,
    pub attempt_count: u32,
    pub next_attempt_at: Option<String>,
    pub last_error: Option<String>,
    pub warnings: Option<String>,
    pub records_loaded: Option<u64>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            source_ref: row.get("source_ref")?,
            payload_path: row.get("payload_path")?,
            content_hash: row.get("content_hash")?,
            state: row.get("state")?,
            attempt_count: row.get("attempt_count")?,
            next_attempt_at: row.get("next_attempt_at")?,
            last_error: row.get("last_error")?,
            warnings: row.get("warnings")?,
            records_loaded: row.get("records_loaded")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new job row. The job is durable once this returns.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, source_ref, payload_path, content_hash, state,
             attempt_count, next_attempt_at, last_error, warnings, records_loaded,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.source_ref,
                job.payload_path,
                job.content_hash,
                job.state,
                job.attempt_count,
                job.next_attempt_at,
                job.last_error,
                job.warnings,
                job.records_loaded,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Atomically claims a job for processing: `pending|retrying -> processing`,
/// incrementing the attempt counter. Returns the updated row, or `None` if
/// the job was not claimable (already owned, or terminal).
pub fn claim(db: &Database, id: &str, now: &str) -> Result<Option<JobRow>, DatabaseError> {
    let changed = db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE jobs
             SET state = 'processing',
                 attempt_count = attempt_count + 1,
                 next_attempt_at = NULL,
                 updated_at = ?2
             WHERE id = ?1 AND state IN ('pending', 'retrying')",
            params![id, now],
        )?;
        Ok::<_, DatabaseError>(n)
    })?;

    if changed == 0 {
        return Ok(None);
    }
    find_by_id(db, id)
}

/// Jobs eligible to run now: `pending`, or `retrying` whose backoff delay
/// has elapsed. Ordered by enqueue time so bound-1 execution is strictly
/// sequential.
pub fn due_jobs(db: &Database, now: &str, limit: u64) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs
             WHERE state IN ('pending', 'retrying')
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?2",
        )?;
        let rows: Vec<JobRow> = stmt
            .query_map(params![now, limit as i64], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Records a successful attempt and moves the job to its terminal state.
pub fn mark_succeeded(
    db: &Database,
    id: &str,
    records_loaded: u64,
    payload_path: &str,
    warnings: Option<&str>,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs
             SET state = 'succeeded', records_loaded = ?2, payload_path = ?3,
                 warnings = ?4, next_attempt_at = NULL, updated_at = ?5
             WHERE id = ?1 AND state = 'processing'",
            params![id, records_loaded, payload_path, warnings, now],
        )?;
        Ok(())
    })
}

/// Schedules a re-attempt after a transient failure.
pub fn mark_retrying(
    db: &Database,
    id: &str,
    error: &str,
    next_attempt_at: &str,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs
             SET state = 'retrying', last_error = ?2, next_attempt_at = ?3, updated_at = ?4
             WHERE id = ?1 AND state = 'processing'",
            params![id, error, next_attempt_at, now],
        )?;
        Ok(())
    })
}

/// Moves a job to the terminal `failed` state.
pub fn mark_failed(
    db: &Database,
    id: &str,
    error: &str,
    payload_path: &str,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs
             SET state = 'failed', last_error = ?2, payload_path = ?3,
                 next_attempt_at = NULL, updated_at = ?4
             WHERE id = ?1 AND state = 'processing'",
            params![id, error, payload_path, now],
        )?;
        Ok(())
    })
}

/// Records the content fingerprint. Write-once: a hash already present is
/// never overwritten.
pub fn set_content_hash(db: &Database, id: &str, hash: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET content_hash = ?2 WHERE id = ?1 AND content_hash IS NULL",
            params![id, hash],
        )?;
        Ok(())
    })
}

/// Startup recovery: any job left in `processing` by a crash has no
/// recorded outcome and is re-attempted. Returns how many were recovered.
pub fn recover_interrupted(db: &Database, now: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "UPDATE jobs
             SET state = 'retrying', next_attempt_at = ?1, updated_at = ?1
             WHERE state = 'processing'",
            params![now],
        )?;
        Ok(n as u64)
    })
}

/// Counts jobs not yet in a terminal state.
pub fn nonterminal_count(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state IN ('pending', 'processing', 'retrying')",
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Counts jobs with the given state.
pub fn count_by_state(db: &Database, state: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = ?1",
            params![state],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Per-state job counts for the status report.
pub fn state_counts(db: &Database) -> Result<Vec<(String, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state ORDER BY state")?;
        let rows: Vec<(String, u64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            source_ref: "msg-1/shipment_001.xlsx".to_string(),
            payload_path: "/tmp/pending/shipment_001.xlsx".to_string(),
            content_hash: None,
            state: "pending".to_string(),
            attempt_count: 0,
            next_attempt_at: None,
            last_error: None,
            warnings: None,
            records_loaded: None,
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            updated_at: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample_job("job-1")).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found.state, "pending");
        assert_eq!(found.attempt_count, 0);
        assert_eq!(found.source_ref, "msg-1/shipment_001.xlsx");
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nope").unwrap().is_none());
    }

    #[test]
    fn test_claim_increments_attempts() {
        let db = test_db();
        insert(&db, &sample_job("job-2")).unwrap();

        let claimed = claim(&db, "job-2", "2026-01-01T00:01:00+00:00")
            .unwrap()
            .unwrap();
        assert_eq!(claimed.state, "processing");
        assert_eq!(claimed.attempt_count, 1);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let db = test_db();
        insert(&db, &sample_job("job-3")).unwrap();

        assert!(claim(&db, "job-3", "t1").unwrap().is_some());
        // Second claim must lose: the job is already processing.
        assert!(claim(&db, "job-3", "t2").unwrap().is_none());
    }

    #[test]
    fn test_claim_terminal_job_fails() {
        let db = test_db();
        insert(&db, &sample_job("job-4")).unwrap();
        claim(&db, "job-4", "t1").unwrap();
        mark_succeeded(&db, "job-4", 5, "/tmp/processed/x.xlsx", None, "t2").unwrap();

        assert!(claim(&db, "job-4", "t3").unwrap().is_none());
        let row = find_by_id(&db, "job-4").unwrap().unwrap();
        assert_eq!(row.state, "succeeded");
        assert_eq!(row.records_loaded, Some(5));
    }

    #[test]
    fn test_retry_cycle() {
        let db = test_db();
        insert(&db, &sample_job("job-5")).unwrap();
        claim(&db, "job-5", "t1").unwrap();
        mark_retrying(&db, "job-5", "db busy", "2026-01-01T00:00:02+00:00", "t1").unwrap();

        let row = find_by_id(&db, "job-5").unwrap().unwrap();
        assert_eq!(row.state, "retrying");
        assert_eq!(row.last_error.as_deref(), Some("db busy"));

        // Not due before the backoff delay elapses.
        let due = due_jobs(&db, "2026-01-01T00:00:01+00:00", 10).unwrap();
        assert!(due.is_empty());

        // Due once the delay has elapsed.
        let due = due_jobs(&db, "2026-01-01T00:00:03+00:00", 10).unwrap();
        assert_eq!(due.len(), 1);

        let reclaimed = claim(&db, "job-5", "t2").unwrap().unwrap();
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[test]
    fn test_due_jobs_ordered_by_enqueue_time() {
        let db = test_db();
        let mut first = sample_job("early");
        first.created_at = "2026-01-01T00:00:00+00:00".to_string();
        let mut second = sample_job("late");
        second.created_at = "2026-01-02T00:00:00+00:00".to_string();
        insert(&db, &second).unwrap();
        insert(&db, &first).unwrap();

        let due = due_jobs(&db, "2026-01-03T00:00:00+00:00", 10).unwrap();
        assert_eq!(due[0].id, "early");
        assert_eq!(due[1].id, "late");
    }

    #[test]
    fn test_content_hash_is_write_once() {
        let db = test_db();
        insert(&db, &sample_job("job-6")).unwrap();

        set_content_hash(&db, "job-6", "aaa").unwrap();
        set_content_hash(&db, "job-6", "bbb").unwrap();

        let row = find_by_id(&db, "job-6").unwrap().unwrap();
        assert_eq!(row.content_hash.as_deref(), Some("aaa"));
    }

    #[test]
    fn test_recover_interrupted() {
        let db = test_db();
        insert(&db, &sample_job("crashed")).unwrap();
        claim(&db, "crashed", "t1").unwrap();

        let recovered = recover_interrupted(&db, "t2").unwrap();
        assert_eq!(recovered, 1);

        let row = find_by_id(&db, "crashed").unwrap().unwrap();
        assert_eq!(row.state, "retrying");
        // The attempt counter is preserved; recovery is not an attempt.
        assert_eq!(row.attempt_count, 1);
    }

    #[test]
    fn test_counts() {
        let db = test_db();
        insert(&db, &sample_job("a")).unwrap();
        insert(&db, &sample_job("b")).unwrap();
        claim(&db, "a", "t1").unwrap();
        mark_failed(&db, "a", "broken", "/tmp/errors/a.xlsx", "t2").unwrap();

        assert_eq!(nonterminal_count(&db).unwrap(), 1);
        assert_eq!(count_by_state(&db, "failed").unwrap(), 1);
        assert_eq!(count_by_state(&db, "pending").unwrap(), 1);

        let counts = state_counts(&db).unwrap();
        assert!(counts.contains(&("failed".to_string(), 1)));
        assert!(counts.contains(&("pending".to_string(), 1)));
    }
}
