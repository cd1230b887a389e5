//! Dedup index — which file fingerprints and which unique keys have been
//! committed. Append/upsert only, never edited in place.

use rusqlite::params;

use super::{Database, DatabaseError};

/// A committed file entry in the dedup index.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub content_hash: String,
    pub job_id: String,
    pub outcome: String,
    pub committed_at: String,
}

/// Looks up a content hash. A hit means the identical bytes were already
/// fully processed and the new job can short-circuit to the duplicate path.
pub fn find_file(db: &Database, content_hash: &str) -> Result<Option<FileEntry>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT content_hash, job_id, outcome, committed_at
             FROM processed_files WHERE content_hash = ?1",
        )?;
        let mut rows = stmt.query_map(params![content_hash], |r| {
            Ok(FileEntry {
                content_hash: r.get(0)?,
                job_id: r.get(1)?,
                outcome: r.get(2)?,
                committed_at: r.get(3)?,
            })
        })?;
        match rows.next() {
            Some(Ok(entry)) => Ok(Some(entry)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Records a committed file. First writer wins; a hash already present is
/// left untouched.
pub fn record_file(db: &Database, entry: &FileEntry) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR IGNORE INTO processed_files (content_hash, job_id, outcome, committed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.content_hash,
                entry.job_id,
                entry.outcome,
                entry.committed_at
            ],
        )?;
        Ok(())
    })
}

/// Stamps the last commit time for each unique key in a committed batch.
pub fn record_keys(db: &Database, keys: &[String], committed_at: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "INSERT INTO committed_keys (unique_key, last_committed_at)
             VALUES (?1, ?2)
             ON CONFLICT(unique_key) DO UPDATE SET last_committed_at = excluded.last_committed_at",
        )?;
        for key in keys {
            stmt.execute(params![key, committed_at])?;
        }
        Ok(())
    })
}

/// Distinct committed keys and the most recent commit stamp across all of
/// them, for the status report.
pub fn keys_summary(db: &Database) -> Result<(u64, Option<String>), DatabaseError> {
    db.with_conn(|conn| {
        let summary = conn.query_row(
            "SELECT COUNT(*), MAX(last_committed_at) FROM committed_keys",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(summary)
    })
}

/// Total committed files, for the status report.
pub fn count_files(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM processed_files", [], |r| r.get(0))?;
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn entry(hash: &str, job: &str) -> FileEntry {
        FileEntry {
            content_hash: hash.to_string(),
            job_id: job.to_string(),
            outcome: "loaded".to_string(),
            committed_at: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn test_record_and_find_file() {
        let db = test_db();
        assert!(find_file(&db, "abc").unwrap().is_none());

        record_file(&db, &entry("abc", "job-1")).unwrap();
        let found = find_file(&db, "abc").unwrap().unwrap();
        assert_eq!(found.job_id, "job-1");
        assert_eq!(found.outcome, "loaded");
    }

    #[test]
    fn test_record_file_first_writer_wins() {
        let db = test_db();
        record_file(&db, &entry("abc", "job-1")).unwrap();
        record_file(&db, &entry("abc", "job-2")).unwrap();

        let found = find_file(&db, "abc").unwrap().unwrap();
        assert_eq!(found.job_id, "job-1");
    }

    #[test]
    fn test_record_keys_last_write_wins() {
        let db = test_db();
        let keys = vec!["HAWB001".to_string(), "HAWB002".to_string()];
        record_keys(&db, &keys, "2026-01-01T00:00:00+00:00").unwrap();
        record_keys(&db, &keys[..1].to_vec(), "2026-02-01T00:00:00+00:00").unwrap();

        let stamp = |key: &str| -> Option<String> {
            db.with_conn::<_, _, DatabaseError>(|conn| {
                let mut stmt = conn
                    .prepare("SELECT last_committed_at FROM committed_keys WHERE unique_key = ?1")?;
                let mut rows = stmt.query_map(params![key], |r| r.get::<_, String>(0))?;
                match rows.next() {
                    Some(row) => Ok(Some(row.map_err(DatabaseError::Sqlite)?)),
                    None => Ok(None),
                }
            })
            .unwrap()
        };
        assert_eq!(stamp("HAWB001").as_deref(), Some("2026-02-01T00:00:00+00:00"));
        assert_eq!(stamp("HAWB002").as_deref(), Some("2026-01-01T00:00:00+00:00"));
        assert!(stamp("HAWB999").is_none());
    }

    #[test]
    fn test_keys_summary() {
        let db = test_db();
        assert_eq!(keys_summary(&db).unwrap(), (0, None));

        let keys = vec!["HAWB001".to_string(), "HAWB002".to_string()];
        record_keys(&db, &keys, "2026-01-01T00:00:00+00:00").unwrap();
        record_keys(&db, &keys[..1].to_vec(), "2026-02-01T00:00:00+00:00").unwrap();

        let (count, latest) = keys_summary(&db).unwrap();
        assert_eq!(count, 2);
        assert_eq!(latest.as_deref(), Some("2026-02-01T00:00:00+00:00"));
    }

    #[test]
    fn test_count_files() {
        let db = test_db();
        assert_eq!(count_files(&db).unwrap(), 0);
        record_file(&db, &entry("a", "j1")).unwrap();
        record_file(&db, &entry("b", "j2")).unwrap();
        assert_eq!(count_files(&db).unwrap(), 2);
    }
}
