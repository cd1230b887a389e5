//! Payload areas on disk: `pending/` for jobs not yet terminal,
//! `processed/` and `errors/` for terminal outcomes.
//!
//! A payload is written to `pending/` before its job row exists and moved
//! out only after the job reaches a terminal state, so a crash at any point
//! leaves the bytes recoverable.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;

use crate::config::StorageConfig;
use crate::error::StorageError;

/// Move a file from `src` to `dst`. Uses `rename` first (fast, atomic on
/// the same filesystem) and falls back to copy + delete for cross-device
/// moves.
fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    std::fs::copy(src, dst).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    std::fs::remove_file(src).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

pub struct PayloadStore {
    pending_dir: PathBuf,
    processed_dir: PathBuf,
    errors_dir: PathBuf,
}

impl PayloadStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            pending_dir: config.pending_dir.clone(),
            processed_dir: config.processed_dir.clone(),
            errors_dir: config.errors_dir.clone(),
        }
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    /// Durably writes a payload into `pending/` and returns its path.
    /// The write is exclusive-create with numbered fallbacks, then synced,
    /// so a returned path means the bytes are on disk.
    pub fn write_pending(&self, filename: &str, content: &[u8]) -> Result<PathBuf, StorageError> {
        ensure_directory(&self.pending_dir)?;
        let safe_name = sanitize_filename(filename);
        write_exclusive(&self.pending_dir, &safe_name, content)
    }

    /// Moves a terminal payload into today's subdirectory of `processed/`.
    pub fn move_to_processed(&self, payload: &Path) -> Result<PathBuf, StorageError> {
        self.move_to_area(payload, &self.processed_dir)
    }

    /// Moves a terminal payload into today's subdirectory of `errors/`.
    pub fn move_to_errors(&self, payload: &Path) -> Result<PathBuf, StorageError> {
        self.move_to_area(payload, &self.errors_dir)
    }

    fn move_to_area(&self, payload: &Path, area: &Path) -> Result<PathBuf, StorageError> {
        let date_dir = area.join(Utc::now().format("%Y-%m-%d").to_string());
        ensure_directory(&date_dir)?;

        let original_name = payload
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("payload");
        let destination = resolve_conflict(&date_dir, original_name)?;

        move_file(payload, &destination)?;
        Ok(destination)
    }

    /// Deletes processed payloads older than the retention period. Returns
    /// how many files were removed. Date subdirectories emptied by the
    /// sweep are removed as well.
    pub fn sweep_processed(&self, retention_days: u32) -> Result<usize, StorageError> {
        if !self.processed_dir.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now() - Duration::from_secs(u64::from(retention_days) * 86_400);

        let mut removed = 0;
        let entries =
            std::fs::read_dir(&self.processed_dir).map_err(|e| StorageError::WriteFile {
                path: self.processed_dir.clone(),
                source: e,
            })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                removed += sweep_directory(&path, cutoff)?;
                // Only succeeds when the sweep emptied it.
                let _ = std::fs::remove_dir(&path);
            } else if is_older_than(&path, cutoff) {
                std::fs::remove_file(&path).map_err(|e| StorageError::WriteFile {
                    path: path.clone(),
                    source: e,
                })?;
                removed += 1;
            }
        }

        if removed > 0 {
            log::info!("Retention sweep removed {} processed payloads", removed);
        }
        Ok(removed)
    }
}

fn sweep_directory(dir: &Path, cutoff: SystemTime) -> Result<usize, StorageError> {
    let mut removed = 0;
    let entries = std::fs::read_dir(dir).map_err(|e| StorageError::WriteFile {
        path: dir.to_path_buf(),
        source: e,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && is_older_than(&path, cutoff) {
            std::fs::remove_file(&path).map_err(|e| StorageError::WriteFile {
                path: path.clone(),
                source: e,
            })?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn is_older_than(path: &Path, cutoff: SystemTime) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| modified < cutoff)
        .unwrap_or(false)
}

fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// Strips path separators and control characters from an attachment name
/// so it cannot escape the pending area.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "payload".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Creates the file exclusively (O_CREAT | O_EXCL), trying numbered
/// variants on collision, and syncs it before returning.
fn write_exclusive(dir: &Path, filename: &str, content: &[u8]) -> Result<PathBuf, StorageError> {
    let (base, ext) = split_extension(filename);

    for counter in 1..=1000 {
        let try_filename = if counter == 1 {
            filename.to_string()
        } else {
            match ext {
                Some(ext) => format!("{}_{}{}", base, counter, ext),
                None => format!("{}_{}", base, counter),
            }
        };
        let try_path = dir.join(&try_filename);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&try_path)
        {
            Ok(mut file) => {
                file.write_all(content)
                    .and_then(|_| file.sync_all())
                    .map_err(|e| StorageError::WriteFile {
                        path: try_path.clone(),
                        source: e,
                    })?;
                return Ok(try_path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(StorageError::WriteFile {
                    path: try_path,
                    source: e,
                });
            }
        }
    }

    Err(StorageError::FileExists(dir.join(filename)))
}

/// Finds an available name in `directory`, appending `_2`, `_3`, ... on
/// collision. The caller still owns the race between check and create;
/// moves into date directories are effectively single-writer here.
fn resolve_conflict(directory: &Path, filename: &str) -> Result<PathBuf, StorageError> {
    let path = directory.join(filename);
    if std::fs::symlink_metadata(&path).is_err() {
        return Ok(path);
    }

    let (base, ext) = split_extension(filename);
    for counter in 2..=1000 {
        let new_filename = match ext {
            Some(ext) => format!("{}_{}{}", base, counter, ext),
            None => format!("{}_{}", base, counter),
        };
        let new_path = directory.join(&new_filename);
        if std::fs::symlink_metadata(&new_path).is_err() {
            return Ok(new_path);
        }
    }

    Err(StorageError::FileExists(path))
}

fn split_extension(filename: &str) -> (&str, Option<&str>) {
    match filename.rfind('.') {
        Some(dot) if dot > 0 => (&filename[..dot], Some(&filename[dot..])),
        _ => (filename, None),
    }
}
