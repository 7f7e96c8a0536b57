//! Relay configuration.

use serde::Deserialize;
use std::collections::HashMap;

/// Configuration for the relay. Loaded from an optional `relay` file plus
/// `RELAY_`-prefixed environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Primary upstream API keys.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Auxiliary (Vertex express) API keys. Same semantics as the
    /// primary pool, scheduled independently.
    #[serde(default)]
    pub vertex_api_keys: Vec<String>,

    /// Failures before a key is considered disabled.
    #[serde(default = "defaults::max_failures")]
    pub max_failures: u32,

    /// Attempts per request before giving up.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Per-model RPM ceilings. Models without an entry match by family
    /// token, then fall back to the most conservative configured limit.
    #[serde(default)]
    pub rpm_limits: HashMap<String, u32>,

    #[serde(default = "defaults::rpm_window_seconds")]
    pub rpm_window_seconds: u64,

    /// Prefer the last-used key while it has window headroom. Trades
    /// upstream cache hits against spreading load.
    #[serde(default = "defaults::rpm_prefer_cache")]
    pub rpm_prefer_cache: bool,

    #[serde(default = "defaults::upstream_base_url")]
    pub upstream_base_url: String,

    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,

    /// Admin bearer token. Empty disables bearer access to `/api`.
    #[serde(default)]
    pub auth_token: String,

    /// Client tokens admitted on the proxy surface.
    #[serde(default)]
    pub allowed_tokens: Vec<String>,

    /// Skip admin auth for loopback callers.
    #[serde(default = "defaults::localhost_bypass_auth")]
    pub localhost_bypass_auth: bool,

    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// In-memory error log ring size.
    #[serde(default = "defaults::error_log_capacity")]
    pub error_log_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            vertex_api_keys: Vec::new(),
            max_failures: defaults::max_failures(),
            max_retries: defaults::max_retries(),
            rpm_limits: HashMap::new(),
            rpm_window_seconds: defaults::rpm_window_seconds(),
            rpm_prefer_cache: defaults::rpm_prefer_cache(),
            upstream_base_url: defaults::upstream_base_url(),
            bind_address: defaults::bind_address(),
            auth_token: String::new(),
            allowed_tokens: Vec::new(),
            localhost_bypass_auth: defaults::localhost_bypass_auth(),
            request_timeout_secs: defaults::request_timeout_secs(),
            error_log_capacity: defaults::error_log_capacity(),
        }
    }
}

mod defaults {
    pub fn max_failures() -> u32 {
        3
    }

    pub fn max_retries() -> u32 {
        3
    }

    pub fn rpm_window_seconds() -> u64 {
        60
    }

    pub fn rpm_prefer_cache() -> bool {
        true
    }

    pub fn upstream_base_url() -> String {
        "https://generativelanguage.googleapis.com".into()
    }

    pub fn bind_address() -> String {
        "0.0.0.0:8000".into()
    }

    pub fn localhost_bypass_auth() -> bool {
        true
    }

    pub fn request_timeout_secs() -> u64 {
        300
    }

    pub fn error_log_capacity() -> usize {
        1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_failures, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.rpm_window_seconds, 60);
        assert!(config.rpm_prefer_cache);
        assert!(config.localhost_bypass_auth);
        assert!(config.api_keys.is_empty());
        assert_eq!(config.bind_address, "0.0.0.0:8000");
    }

    #[test]
    fn test_explicit_values_override_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "api_keys": ["k1", "k2"],
                "rpm_limits": {"gemini-2.5-flash": 10},
                "rpm_prefer_cache": false,
                "max_retries": 5
            }"#,
        )
        .unwrap();
        assert_eq!(config.api_keys.len(), 2);
        assert_eq!(config.rpm_limits.get("gemini-2.5-flash"), Some(&10));
        assert!(!config.rpm_prefer_cache);
        assert_eq!(config.max_retries, 5);
    }
}
