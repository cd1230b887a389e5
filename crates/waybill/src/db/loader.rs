//! Staged loading of validated records into the target table.
//!
//! Each load is one SQLite transaction: create a per-job staging table,
//! bulk-insert the batch, upsert the whole staging set into the target,
//! drop the staging table, commit. Any error rolls the whole thing back,
//! so the target never exposes a half-loaded file.

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, ErrorCode, Transaction, TransactionBehavior};
use thiserror::Error;

use super::{Database, DatabaseError};
use crate::config::DatabaseConfig;
use crate::sheet::{FieldValue, Record};

/// A load failure, classified for retry handling. Transient failures
/// (locks, busy timeouts, I/O hiccups) are worth retrying; permanent ones
/// (constraint violations, type mismatches) will fail identically every
/// attempt.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Transient load failure: {0}")]
    Transient(String),
    #[error("Permanent load failure: {0}")]
    Permanent(String),
}

impl LoadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Transient(_))
    }
}

impl From<rusqlite::Error> for LoadError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(ffi, _) => match ffi.code {
                ErrorCode::ConstraintViolation
                | ErrorCode::TypeMismatch
                | ErrorCode::ApiMisuse
                | ErrorCode::ParameterOutOfRange => LoadError::Permanent(e.to_string()),
                // Busy, locked, interrupted, disk trouble: the next attempt
                // may well succeed.
                _ => LoadError::Transient(e.to_string()),
            },
            rusqlite::Error::InvalidColumnType(..) | rusqlite::Error::ToSqlConversionFailure(_) => {
                LoadError::Permanent(e.to_string())
            }
            _ => LoadError::Transient(e.to_string()),
        }
    }
}

impl From<DatabaseError> for LoadError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Sqlite(inner) => inner.into(),
            DatabaseError::LockPoisoned => LoadError::Permanent(e.to_string()),
            other => LoadError::Transient(other.to_string()),
        }
    }
}

/// Loads record batches into the configured target table.
pub struct Loader {
    db: Database,
    config: DatabaseConfig,
}

impl Loader {
    pub fn new(db: Database, config: DatabaseConfig) -> Self {
        Self { db, config }
    }

    /// Loads a batch atomically. Returns the number of records applied.
    ///
    /// Rows whose unique key already exists in the target are overwritten
    /// (last write wins); new keys are inserted. Re-loading an identical
    /// batch converges: the second load leaves the same column values in
    /// place and only refreshes the processing stamp.
    pub fn load(
        &self,
        job_id: &str,
        file_source: &str,
        records: &[Record],
    ) -> Result<u64, LoadError> {
        if records.is_empty() {
            return Ok(0);
        }

        let staging = self.staging_table_name(job_id);
        let processed_at = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            self.ensure_target(&tx)?;

            tx.execute_batch(&self.staging_ddl(&staging))?;
            {
                let mut stmt = tx.prepare(&self.staging_insert_sql(&staging))?;
                for record in records {
                    let values = self.record_values(record);
                    stmt.execute(rusqlite::params_from_iter(values))?;
                }
            }

            let staged: u64 =
                tx.query_row(&format!("SELECT COUNT(*) FROM {}", staging), [], |r| {
                    r.get(0)
                })?;
            tx.execute(
                &self.upsert_sql(&staging),
                params![file_source, processed_at],
            )?;
            tx.execute_batch(&format!("DROP TABLE {}", staging))?;
            tx.commit()?;

            log::debug!(
                "Loaded {} records into {} for job {}",
                staged,
                self.config.target_table,
                job_id
            );
            Ok(staged)
        })
    }

    /// Per-job staging table name. Job ids are UUIDs; strip everything
    /// that is not a valid identifier character.
    fn staging_table_name(&self, job_id: &str) -> String {
        let suffix: String = job_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        format!("{}_{}", self.config.staging_prefix, suffix)
    }

    fn ensure_target(&self, tx: &Transaction<'_>) -> Result<(), rusqlite::Error> {
        let mut columns: Vec<String> = Vec::with_capacity(self.config.columns.len() + 2);
        for column in &self.config.columns {
            if *column == self.config.unique_key {
                columns.push(format!("{} TEXT PRIMARY KEY", column));
            } else {
                columns.push(format!("{} TEXT", column));
            }
        }
        columns.push("file_source TEXT".to_string());
        columns.push("processed_at TEXT NOT NULL".to_string());

        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.config.target_table,
            columns.join(", ")
        ))
    }

    fn staging_ddl(&self, staging: &str) -> String {
        let columns: Vec<String> = self
            .config
            .columns
            .iter()
            .map(|c| format!("{} TEXT", c))
            .collect();
        format!("CREATE TEMP TABLE {} ({})", staging, columns.join(", "))
    }

    fn staging_insert_sql(&self, staging: &str) -> String {
        let placeholders: Vec<String> = (1..=self.config.columns.len())
            .map(|i| format!("?{}", i))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            staging,
            self.config.columns.join(", "),
            placeholders.join(", ")
        )
    }

    /// Set-based upsert from staging into the target. `WHERE true` keeps
    /// the upsert clause unambiguous for the INSERT ... SELECT form.
    fn upsert_sql(&self, staging: &str) -> String {
        let mut assignments: Vec<String> = self
            .config
            .columns
            .iter()
            .filter(|c| **c != self.config.unique_key)
            .map(|c| format!("{} = excluded.{}", c, c))
            .collect();
        assignments.push("file_source = excluded.file_source".to_string());
        assignments.push("processed_at = excluded.processed_at".to_string());

        format!(
            "INSERT INTO {target} ({cols}, file_source, processed_at)
             SELECT {cols}, ?1, ?2 FROM {staging} WHERE true
             ON CONFLICT({key}) DO UPDATE SET {assignments}",
            target = self.config.target_table,
            cols = self.config.columns.join(", "),
            staging = staging,
            key = self.config.unique_key,
            assignments = assignments.join(", "),
        )
    }

    fn record_values(&self, record: &Record) -> Vec<Value> {
        self.config
            .columns
            .iter()
            .map(|column| {
                if *column == self.config.unique_key {
                    Value::Text(record.unique_key.clone())
                } else {
                    to_sql_value(record.get(column))
                }
            })
            .collect()
    }
}

fn to_sql_value(value: Option<&FieldValue>) -> Value {
    match value {
        None | Some(FieldValue::Null) => Value::Null,
        Some(FieldValue::Text(s)) => Value::Text(s.clone()),
        Some(FieldValue::Number(n)) => Value::Real(*n),
        Some(FieldValue::Bool(b)) => Value::Integer(i64::from(*b)),
    }
}
