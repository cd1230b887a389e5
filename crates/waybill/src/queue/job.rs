use std::path::PathBuf;

use crate::db::job_repo::JobRow;

/// Lifecycle states of a job. Transitions are forward-only:
/// `pending -> processing -> {succeeded | retrying | failed}` and
/// `retrying -> processing`. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Processing,
    Retrying,
    Succeeded,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Retrying,
        JobState::Succeeded,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Retrying => "retrying",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The slice of a claimed ledger row a worker needs to run one attempt.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub source_ref: String,
    pub payload_path: PathBuf,
    /// Fingerprint recorded by an earlier attempt, if any. Lets a retry
    /// hit the dedup index without re-reading a payload that may already
    /// have been archived.
    pub content_hash: Option<String>,
    pub attempt_count: u32,
}

impl Job {
    pub fn from_row(row: &JobRow) -> Self {
        Self {
            id: row.id.clone(),
            source_ref: row.source_ref.clone(),
            payload_path: PathBuf::from(&row.payload_path),
            content_hash: row.content_hash.clone(),
            attempt_count: row.attempt_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in JobState::ALL {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(!JobState::Retrying.is_terminal());
    }
}
