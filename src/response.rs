//! API response types.

use crate::scheduler::{KeyStatus, KeysByStatus};
use serde::Serialize;
use std::collections::BTreeMap;

/// `GET /api/rpm-status` body.
#[derive(Serialize)]
pub struct RpmStatusResponse {
    pub api_keys: BTreeMap<String, KeyStatus>,
    pub vertex_keys: BTreeMap<String, KeyStatus>,
    pub current_model: Option<String>,
    pub rpm_window_seconds: u64,
    pub rpm_prefer_cache: bool,
    pub rpm_limits: BTreeMap<String, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_rpm_limit: Option<u32>,
}

/// `GET /api/keys/status` body.
#[derive(Serialize)]
pub struct KeysStatusResponse {
    pub api_keys: KeysByStatus,
    pub vertex_keys: KeysByStatus,
}

#[derive(Serialize)]
pub struct PoolStats {
    pub total_keys: usize,
    pub valid_keys: usize,
    pub current_model: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub requests: u64,
    pub api_pool: PoolStats,
    pub vertex_pool: PoolStats,
}
