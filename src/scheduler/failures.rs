//! Per-key failure accounting with a disable threshold.
//!
//! Counters only ever grow; there is no decay on success. Operators
//! reset them through the admin surface, and a reconfigure carries
//! surviving counters over.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Keys partitioned by validity, with their failure counts.
#[derive(Debug, Clone, Serialize)]
pub struct KeysByStatus {
    pub valid_keys: BTreeMap<String, u32>,
    pub invalid_keys: BTreeMap<String, u32>,
}

pub struct FailureTracker {
    counts: Mutex<HashMap<String, u32>>,
    max_failures: u32,
}

impl FailureTracker {
    pub fn new(keys: &[String], max_failures: u32) -> Self {
        let counts = keys.iter().map(|key| (key.clone(), 0)).collect();
        Self {
            counts: Mutex::new(counts),
            max_failures,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Failure count for a key. Unknown keys read as zero.
    pub fn count(&self, key: &str) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }

    /// A key is valid while its count is below the disable threshold.
    pub fn is_valid(&self, key: &str) -> bool {
        self.count(key) < self.max_failures
    }

    /// Increment a key's counter and return the new count.
    pub fn increment(&self, key: &str) -> u32 {
        let mut counts = self.lock();
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset one key to zero. Returns false for an unknown key.
    pub fn reset(&self, key: &str) -> bool {
        match self.lock().get_mut(key) {
            Some(count) => {
                *count = 0;
                true
            }
            None => false,
        }
    }

    /// Reset every tracked key to zero.
    pub fn reset_all(&self) {
        for count in self.lock().values_mut() {
            *count = 0;
        }
    }

    /// Partition `keys` by validity.
    pub fn classify(&self, keys: &[String]) -> KeysByStatus {
        let counts = self.lock();
        let mut valid_keys = BTreeMap::new();
        let mut invalid_keys = BTreeMap::new();
        for key in keys {
            let count = counts.get(key).copied().unwrap_or(0);
            if count < self.max_failures {
                valid_keys.insert(key.clone(), count);
            } else {
                invalid_keys.insert(key.clone(), count);
            }
        }
        KeysByStatus {
            valid_keys,
            invalid_keys,
        }
    }

    /// Replace the tracked key set. Surviving keys keep their counts,
    /// new keys start at zero, removed keys are forgotten.
    pub fn rebuild(&self, new_keys: &[String]) {
        let mut counts = self.lock();
        let old = std::mem::take(&mut *counts);
        *counts = new_keys
            .iter()
            .map(|key| (key.clone(), old.get(key).copied().unwrap_or(0)))
            .collect();
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }
}
