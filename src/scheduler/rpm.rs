//! Sliding-window RPM accounting per (key, model).
//!
//! Windows hold monotonic timestamps and are pruned lazily on access, so
//! cleanup cost is amortised across reads. A missing (key, model) pair
//! simply counts as zero.

use super::clock::Clock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Limit applied when the configured limit map is empty.
const FALLBACK_RPM_LIMIT: u32 = 10;

/// Window usage for one (key, model) pair, as exposed on the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    pub current_rpm: usize,
    pub rpm_limit: u32,
    pub usage_percentage: f64,
}

/// Per-(key, model) request timestamps within the trailing window.
pub struct RpmTracker {
    windows: HashMap<String, HashMap<String, VecDeque<f64>>>,
    /// Sorted by model name so fuzzy lookups are deterministic.
    limits: Vec<(String, u32)>,
    window_secs: f64,
    clock: Clock,
}

impl RpmTracker {
    pub fn new(rpm_limits: &HashMap<String, u32>, window_secs: u64, clock: Clock) -> Self {
        let mut limits: Vec<(String, u32)> = rpm_limits
            .iter()
            .map(|(model, limit)| (model.clone(), *limit))
            .collect();
        limits.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            windows: HashMap::new(),
            limits,
            window_secs: window_secs as f64,
            clock,
        }
    }

    /// RPM limit for a model: exact match, else a family-token match
    /// (`lite`, `flash` unless the model is a lite variant, `pro`), else
    /// the most conservative configured limit.
    pub fn limit_for(&self, model: &str) -> u32 {
        if let Some((_, limit)) = self.limits.iter().find(|(name, _)| name == model) {
            return *limit;
        }

        let model = model.to_lowercase();
        for (name, limit) in &self.limits {
            let name = name.to_lowercase();
            let parts: Vec<&str> = name.split('-').collect();
            if parts.contains(&"lite") && model.contains("lite") {
                return *limit;
            }
            if parts.contains(&"flash") && model.contains("flash") && !model.contains("lite") {
                return *limit;
            }
            if parts.contains(&"pro") && model.contains("pro") {
                return *limit;
            }
        }

        self.limits
            .iter()
            .map(|(_, limit)| *limit)
            .min()
            .unwrap_or(FALLBACK_RPM_LIMIT)
    }

    /// Requests recorded for (key, model) in the trailing window. Expired
    /// entries are dropped from the head first.
    pub fn count(&mut self, key: &str, model: &str) -> usize {
        let cutoff = self.clock.now_secs() - self.window_secs;
        match self.windows.get_mut(key).and_then(|m| m.get_mut(model)) {
            Some(window) => {
                while window.front().is_some_and(|t| *t < cutoff) {
                    window.pop_front();
                }
                window.len()
            }
            None => 0,
        }
    }

    /// Record one request for (key, model) at the current time.
    pub fn record(&mut self, key: &str, model: &str) {
        let now = self.clock.now_secs();
        self.windows
            .entry(key.to_string())
            .or_default()
            .entry(model.to_string())
            .or_default()
            .push_back(now);
    }

    pub fn within_limit(&mut self, key: &str, model: &str) -> bool {
        self.count(key, model) < self.limit_for(model) as usize
    }

    /// Usage ratio (count / limit) used by the least-loaded fallback.
    pub fn usage_ratio(&mut self, key: &str, model: &str) -> f64 {
        let limit = self.limit_for(model);
        if limit == 0 {
            return 0.0;
        }
        self.count(key, model) as f64 / limit as f64
    }

    /// Per-model usage for one key, pruned to the current window.
    pub fn key_snapshot(&mut self, key: &str) -> BTreeMap<String, ModelUsage> {
        let models: Vec<String> = self
            .windows
            .get(key)
            .map(|by_model| by_model.keys().cloned().collect())
            .unwrap_or_default();

        let mut out = BTreeMap::new();
        for model in models {
            let current_rpm = self.count(key, &model);
            let rpm_limit = self.limit_for(&model);
            let usage_percentage = if rpm_limit > 0 {
                current_rpm as f64 / rpm_limit as f64 * 100.0
            } else {
                0.0
            };
            out.insert(
                model,
                ModelUsage {
                    current_rpm,
                    rpm_limit,
                    usage_percentage,
                },
            );
        }
        out
    }

    /// Drop all window history. Limits are static and survive.
    pub fn clear(&mut self) {
        self.windows.clear();
    }
}
