//! Rotating key scheduler with RPM headroom and failure tracking.
//!
//! One scheduler serves one key pool. Selection prefers the cached key
//! while it still has window headroom, then scans from the rotation
//! cursor, then falls back to the least-loaded valid key, and finally
//! forces the cursor key when every key is disabled. Exactly one request
//! is recorded per `choose` call, under the same cursor lock that moves
//! the cursor and cache, so concurrent callers observe a total order.

mod clock;
mod failures;
mod rpm;

pub use clock::Clock;
pub use failures::{FailureTracker, KeysByStatus};
pub use rpm::{ModelUsage, RpmTracker};

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Rotation state guarded by the pool's cursor lock.
struct Rotation {
    keys: Vec<String>,
    cursor: usize,
    cached: Option<String>,
    current_model: Option<String>,
}

/// Admin view of one key: window usage per model, cache marker, failures.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub models: BTreeMap<String, ModelUsage>,
    pub is_current: bool,
    pub failure_count: u32,
}

/// Consistent per-pool snapshot taken under one cursor-lock hold.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub keys: BTreeMap<String, KeyStatus>,
    pub current_model: Option<String>,
}

pub struct KeyScheduler {
    /// Pool tag used in logs.
    label: &'static str,
    rotation: Mutex<Rotation>,
    failures: FailureTracker,
    rpm: Mutex<RpmTracker>,
    max_retries: u32,
    prefer_cache: bool,
}

impl KeyScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: &'static str,
        keys: Vec<String>,
        rpm_limits: &HashMap<String, u32>,
        window_secs: u64,
        max_failures: u32,
        max_retries: u32,
        prefer_cache: bool,
        clock: Clock,
    ) -> Self {
        info!(
            pool = label,
            keys = keys.len(),
            window_secs,
            prefer_cache,
            "Key scheduler initialized"
        );
        Self {
            label,
            failures: FailureTracker::new(&keys, max_failures),
            rotation: Mutex::new(Rotation {
                keys,
                cursor: 0,
                cached: None,
                current_model: None,
            }),
            rpm: Mutex::new(RpmTracker::new(rpm_limits, window_secs, clock)),
            max_retries,
            prefer_cache,
        }
    }

    // Lock order within a pool is rotation, then failures or rpm. No path
    // acquires the cursor lock while holding either of the inner locks.

    fn rotation(&self) -> MutexGuard<'_, Rotation> {
        self.rotation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rpm(&self) -> MutexGuard<'_, RpmTracker> {
        self.rpm.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Hot path ---

    /// Hand out a key for `model` and record the request against it.
    /// Returns `None` only when the pool is empty.
    pub fn choose(&self, model: &str) -> Option<String> {
        let mut rotation = self.rotation();
        rotation.current_model = Some(model.to_string());

        // Cache-affinity path: stick with the warm key while it has headroom.
        if self.prefer_cache {
            if let Some(cached) = rotation.cached.clone() {
                if self.failures.is_valid(&cached) {
                    let mut rpm = self.rpm();
                    if rpm.within_limit(&cached, model) {
                        rpm.record(&cached, model);
                        debug!(pool = self.label, key = %redact(&cached), model, "Reusing cached key");
                        return Some(cached);
                    }
                }
            }
        }

        if rotation.keys.is_empty() {
            warn!(pool = self.label, "Key pool is empty");
            return None;
        }

        // Rotating scan: first valid key under its limit, starting at the cursor.
        let len = rotation.keys.len();
        for i in 0..len {
            let idx = (rotation.cursor + i) % len;
            let key = rotation.keys[idx].clone();
            if !self.failures.is_valid(&key) {
                continue;
            }
            let mut rpm = self.rpm();
            if rpm.within_limit(&key, model) {
                rpm.record(&key, model);
                drop(rpm);
                rotation.cursor = (idx + 1) % len;
                rotation.cached = Some(key.clone());
                debug!(pool = self.label, key = %redact(&key), model, "Selected key");
                return Some(key);
            }
        }

        // Least-loaded fallback: every valid key is at capacity.
        if let Some(idx) = self.least_loaded(&rotation.keys, model) {
            let key = rotation.keys[idx].clone();
            rotation.cursor = (idx + 1) % len;
            rotation.cached = Some(key.clone());
            self.rpm().record(&key, model);
            warn!(pool = self.label, key = %redact(&key), model, "All keys at capacity, using least loaded");
            return Some(key);
        }

        // Forced path: every key is disabled.
        let idx = rotation.cursor;
        let key = rotation.keys[idx].clone();
        rotation.cursor = (idx + 1) % len;
        rotation.cached = Some(key.clone());
        self.rpm().record(&key, model);
        warn!(pool = self.label, key = %redact(&key), model, "Every key disabled, forcing selection");
        Some(key)
    }

    /// Index of the valid key with the lowest usage ratio for `model`.
    /// Ties keep the earliest key in insertion order.
    fn least_loaded(&self, keys: &[String], model: &str) -> Option<usize> {
        let valid: Vec<bool> = keys.iter().map(|key| self.failures.is_valid(key)).collect();
        let mut rpm = self.rpm();
        let mut best: Option<(usize, f64)> = None;
        for (idx, key) in keys.iter().enumerate() {
            if !valid[idx] {
                continue;
            }
            let ratio = rpm.usage_ratio(key, model);
            if best.map_or(true, |(_, lowest)| ratio < lowest) {
                best = Some((idx, ratio));
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Count a failed attempt against `key` and, while the retry budget
    /// lasts, pick a replacement. Clearing the cache first forces the
    /// replacement away from the failed key whenever the pool allows it.
    pub fn on_failure(&self, key: &str, attempt: u32, model: &str) -> Option<String> {
        let count = self.failures.increment(key);
        if count >= self.failures.max_failures() {
            warn!(
                pool = self.label,
                key = %redact(key),
                count,
                "Key disabled after repeated failures"
            );
        }
        if attempt >= self.max_retries {
            return None;
        }
        self.rotation().cached = None;
        self.choose(model)
    }

    // --- Failure administration ---

    /// Reset one key's failure count, or every key's when `key` is `None`.
    /// Returns false only for an unknown key.
    pub fn reset_failures(&self, key: Option<&str>) -> bool {
        match key {
            Some(key) => {
                let found = self.failures.reset(key);
                if found {
                    info!(pool = self.label, key = %redact(key), "Failure count reset");
                } else {
                    warn!(pool = self.label, key = %redact(key), "Reset requested for unknown key");
                }
                found
            }
            None => {
                self.failures.reset_all();
                info!(pool = self.label, "All failure counts reset");
                true
            }
        }
    }

    /// Keys partitioned by validity, with counts.
    pub fn classify(&self) -> KeysByStatus {
        let rotation = self.rotation();
        self.failures.classify(&rotation.keys)
    }

    /// First key below the failure threshold, else the first key at all.
    /// `None` for an empty pool.
    pub fn first_valid(&self) -> Option<String> {
        let rotation = self.rotation();
        rotation
            .keys
            .iter()
            .find(|key| self.failures.is_valid(key))
            .cloned()
            .or_else(|| rotation.keys.first().cloned())
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures.count(key)
    }

    // --- Observation ---

    /// Cursor, cache, counters and windows all observed under one
    /// cursor-lock hold, so the view is internally consistent.
    pub fn snapshot(&self) -> PoolSnapshot {
        let rotation = self.rotation();
        let mut rpm = self.rpm();
        let mut keys = BTreeMap::new();
        for key in &rotation.keys {
            keys.insert(
                key.clone(),
                KeyStatus {
                    models: rpm.key_snapshot(key),
                    is_current: rotation.cached.as_deref() == Some(key.as_str()),
                    failure_count: self.failures.count(key),
                },
            );
        }
        PoolSnapshot {
            keys,
            current_model: rotation.current_model.clone(),
        }
    }

    pub fn limit_for(&self, model: &str) -> u32 {
        self.rpm().limit_for(model)
    }

    /// Number of valid (not disabled) keys, for gauges and readiness.
    pub fn valid_count(&self) -> usize {
        let rotation = self.rotation();
        rotation
            .keys
            .iter()
            .filter(|key| self.failures.is_valid(key))
            .count()
    }

    pub fn key_count(&self) -> usize {
        self.rotation().keys.len()
    }

    // --- Lifecycle ---

    /// Replace the key list. Surviving keys keep their failure counts.
    /// The cursor lands on the key the old cursor was about to yield, or
    /// the nearest surviving key in the old order, or the front of the
    /// new list. Window history is discarded; it regrows within one
    /// window width.
    pub fn reconfigure(&self, new_keys: Vec<String>) {
        let mut rotation = self.rotation();

        let start = if rotation.keys.is_empty() {
            None
        } else {
            let len = rotation.keys.len();
            (0..len)
                .map(|i| &rotation.keys[(rotation.cursor + i) % len])
                .find(|key| new_keys.contains(*key))
                .cloned()
        };

        rotation.cursor = start
            .and_then(|key| new_keys.iter().position(|k| *k == key))
            .unwrap_or(0);
        rotation.keys = new_keys;
        rotation.cached = None;
        rotation.current_model = None;

        self.failures.rebuild(&rotation.keys);
        self.rpm().clear();

        info!(
            pool = self.label,
            keys = rotation.keys.len(),
            cursor = rotation.cursor,
            "Key pool reconfigured"
        );
    }
}

/// Shorten a key for log output. Full keys appear only in admin JSON.
pub fn redact(key: &str) -> String {
    match key.get(..8) {
        Some(prefix) if key.len() > 8 => format!("{prefix}..."),
        _ => key.to_string(),
    }
}

// --- Test helpers (shared across sub-module tests) ---
