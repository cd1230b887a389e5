//! In-process coordination of unique keys across concurrent loads.
//!
//! Two jobs asserting overlapping key sets must not load at the same time,
//! or the target row could interleave column values from both. The gate
//! hands out all-or-nothing leases; a job that cannot take every key backs
//! off and retries, which also serializes conflicting loads by commit time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct KeyGate {
    held: Arc<Mutex<HashSet<String>>>,
}

impl KeyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims every key or none. Returns `None` when any key is already
    /// held (or the lock is poisoned, which we treat the same way: do not
    /// load). The lease releases the keys on drop.
    pub fn try_claim(&self, keys: &[String]) -> Option<KeyLease> {
        let mut held = self.held.lock().ok()?;
        if keys.iter().any(|k| held.contains(k)) {
            return None;
        }
        for key in keys {
            held.insert(key.clone());
        }
        Some(KeyLease {
            gate: self.clone(),
            keys: keys.to_vec(),
        })
    }

    #[cfg(test)]
    fn held_count(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }
}

pub struct KeyLease {
    gate: KeyGate,
    keys: Vec<String>,
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if let Ok(mut held) = self.gate.held.lock() {
            for key in &self.keys {
                held.remove(key);
            }
        }
    }
}
