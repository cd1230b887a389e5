//! File processor: fingerprinting and spreadsheet parsing.
//!
//! Turns an opaque byte blob into validated, typed records. Fingerprinting
//! happens over the raw bytes, before parsing, so duplicate detection is
//! independent of parser behavior and column-set changes over time.

use std::collections::HashSet;
use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::DatabaseConfig;
use crate::error::ValidationError;

/// Computes the content fingerprint: SHA-256 over the raw bytes. Identical
/// bytes always yield identical hashes regardless of filename or timestamp.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// A typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Null,
}

/// One validated logical row extracted from a source file.
#[derive(Debug, Clone)]
pub struct Record {
    /// The domain identifier that must be unique in the target table.
    pub unique_key: String,
    /// Non-key columns in configured order.
    pub fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// A non-fatal problem found while validating rows. Persisted to the job
/// ledger as JSON for later diagnosis.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RowWarning {
    /// 1-based sheet row number (the header is row 1).
    pub row: usize,
    pub message: String,
}

/// The parsed, validated output of one file.
#[derive(Debug)]
pub struct SheetBatch {
    pub records: Vec<Record>,
    pub warnings: Vec<RowWarning>,
}

impl SheetBatch {
    /// The unique-key set of this batch, in row order.
    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|r| r.unique_key.clone()).collect()
    }
}

/// Parses the single tabular sheet of a workbook into records.
///
/// The whole file fails (no partial records) if a configured column is
/// absent or the sheet has zero data rows. Rows with a blank unique key are
/// dropped with a warning; duplicate keys within the file keep the first
/// occurrence. If every row is dropped the file fails validation, so a
/// structurally broken file cannot silently ingest nothing.
pub fn parse(bytes: &[u8], config: &DatabaseConfig) -> Result<SheetBatch, ValidationError> {
    let cursor = Cursor::new(bytes);
    let mut workbook = open_workbook_auto_from_rs(cursor)
        .map_err(|e| ValidationError::Unreadable(e.to_string()))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(ValidationError::NoSheets)?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| ValidationError::Unreadable(e.to_string()))?;

    let mut rows = range.rows();
    let header = rows.next().ok_or(ValidationError::EmptySheet)?;
    let headers: Vec<String> = header.iter().map(|c| normalize_header(&cell_text(c))).collect();

    // Locate every configured column in the header, case-insensitively.
    let mut missing = Vec::new();
    let mut positions = Vec::with_capacity(config.columns.len());
    for column in &config.columns {
        match headers.iter().position(|h| h == column) {
            Some(i) => positions.push((column.clone(), i)),
            None => missing.push(column.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(ValidationError::MissingColumns { columns: missing });
    }

    let key_index = positions
        .iter()
        .find(|(name, _)| *name == config.unique_key)
        .map(|(_, i)| *i)
        .ok_or_else(|| ValidationError::MissingColumns {
            columns: vec![config.unique_key.clone()],
        })?;

    let mut records = Vec::new();
    let mut warnings = Vec::new();
    let mut seen_keys = HashSet::new();
    let mut data_rows = 0usize;

    for (offset, row) in rows.enumerate() {
        let row_number = offset + 2;

        if row.iter().all(is_blank) {
            continue;
        }
        data_rows += 1;

        let key = row
            .get(key_index)
            .map(|c| cell_text(c).trim().to_string())
            .unwrap_or_default();
        if key.is_empty() {
            warnings.push(RowWarning {
                row: row_number,
                message: format!("missing value for unique key '{}'", config.unique_key),
            });
            continue;
        }
        if !seen_keys.insert(key.clone()) {
            warnings.push(RowWarning {
                row: row_number,
                message: format!("duplicate key '{}', keeping first occurrence", key),
            });
            continue;
        }

        let fields = positions
            .iter()
            .filter(|(name, _)| *name != config.unique_key)
            .map(|(name, i)| (name.clone(), field_value(row.get(*i))))
            .collect();

        records.push(Record {
            unique_key: key,
            fields,
        });
    }

    if data_rows == 0 {
        return Err(ValidationError::EmptySheet);
    }
    if records.is_empty() {
        return Err(ValidationError::NoUsableRows { dropped: data_rows });
    }

    Ok(SheetBatch { records, warnings })
}

/// Header cleanup: trim, lower-case, spaces to underscores.
fn normalize_header(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(' ', "_")
}

fn is_blank(cell: &Data) -> bool {
    match cell {
        Data::Empty => true,
        Data::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(_) => String::new(),
    }
}

fn field_value(cell: Option<&Data>) -> FieldValue {
    match cell {
        None | Some(Data::Empty) | Some(Data::Error(_)) => FieldValue::Null,
        Some(Data::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                FieldValue::Null
            } else {
                FieldValue::Text(trimmed.to_string())
            }
        }
        Some(Data::Float(f)) => FieldValue::Number(*f),
        Some(Data::Int(i)) => FieldValue::Number(*i as f64),
        Some(Data::Bool(b)) => FieldValue::Bool(*b),
        Some(Data::DateTime(dt)) => FieldValue::Text(dt.to_string()),
        Some(Data::DateTimeIso(s)) => FieldValue::Text(s.clone()),
        Some(Data::DurationIso(s)) => FieldValue::Text(s.clone()),
    }
}
