//! Application state shared across all handlers.

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::observability::{MemoryLog, Observer};
use crate::scheduler::{Clock, KeyScheduler};
use crate::upstream::{GeminiClient, Upstream};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub api_pool: Arc<KeyScheduler>,
    pub vertex_pool: Arc<KeyScheduler>,
    pub api_dispatcher: Dispatcher,
    pub vertex_dispatcher: Dispatcher,
    pub log: Arc<MemoryLog>,
    pub start_time: Instant,
    pub request_count: AtomicU64,
    /// False until a pool has a usable key. `/ready` returns 503 until then.
    pub ready: AtomicBool,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, crate::Error> {
        let upstream: Arc<dyn Upstream> = Arc::new(GeminiClient::new(
            &config.upstream_base_url,
            Duration::from_secs(config.request_timeout_secs),
        )?);
        let log = Arc::new(MemoryLog::new(config.error_log_capacity));

        if config.api_keys.is_empty() {
            warn!("Primary key pool is empty");
        }

        let api_pool = Arc::new(KeyScheduler::new(
            "api",
            config.api_keys.clone(),
            &config.rpm_limits,
            config.rpm_window_seconds,
            config.max_failures,
            config.max_retries,
            config.rpm_prefer_cache,
            Clock::monotonic(),
        ));
        let vertex_pool = Arc::new(KeyScheduler::new(
            "vertex",
            config.vertex_api_keys.clone(),
            &config.rpm_limits,
            config.rpm_window_seconds,
            config.max_failures,
            config.max_retries,
            config.rpm_prefer_cache,
            Clock::monotonic(),
        ));

        let api_dispatcher = Dispatcher::new(
            Arc::clone(&upstream),
            Arc::clone(&api_pool),
            Arc::clone(&log) as Arc<dyn Observer>,
        );
        let vertex_dispatcher = Dispatcher::new(
            upstream,
            Arc::clone(&vertex_pool),
            Arc::clone(&log) as Arc<dyn Observer>,
        );

        let ready = AtomicBool::new(
            !config.api_keys.is_empty() || !config.vertex_api_keys.is_empty(),
        );

        info!(
            api_keys = config.api_keys.len(),
            vertex_keys = config.vertex_api_keys.len(),
            "Relay state initialized"
        );

        Ok(Self {
            config,
            api_pool,
            vertex_pool,
            api_dispatcher,
            vertex_dispatcher,
            log,
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
            ready,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn config_with_keys(api: &[&str], vertex: &[&str]) -> Config {
        Config {
            api_keys: api.iter().map(|s| s.to_string()).collect(),
            vertex_api_keys: vertex.iter().map(|s| s.to_string()).collect(),
            ..Config::default()
        }
    }

    #[test]
    fn test_state_builds_independent_pools() {
        let state = AppState::new(config_with_keys(&["a", "b"], &["v1"])).unwrap();
        assert_eq!(state.api_pool.key_count(), 2);
        assert_eq!(state.vertex_pool.key_count(), 1);
        assert!(state.ready.load(Ordering::Relaxed));
    }

    #[test]
    fn test_state_without_keys_is_not_ready() {
        let state = AppState::new(config_with_keys(&[], &[])).unwrap();
        assert!(!state.ready.load(Ordering::Relaxed));
    }
}
