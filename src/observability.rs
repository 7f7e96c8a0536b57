//! Observation hooks and the in-memory request/error log.
//!
//! The dispatcher reports every attempt through [`Observer`]; it never
//! owns storage and never fails a request over a logging problem.
//! [`MemoryLog`] is the in-process store behind the admin endpoints.
//! Durable persistence is a collaborator concern and lives elsewhere.

use crate::scheduler::redact;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How long request records feed the per-key usage rollup.
const REQUEST_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
/// Hard cap on buffered request records.
const MAX_REQUEST_RECORDS: usize = 100_000;
/// How often the background pruner sweeps expired records.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// One upstream attempt, successful or not.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub model: String,
    pub key: String,
    pub success: bool,
    pub status: u16,
    pub latency_ms: u64,
    pub at: SystemTime,
    pub body_summary: Option<String>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub error: Option<String>,
}

/// One failed upstream attempt, with its payload summary.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub key: String,
    pub model: String,
    pub kind: &'static str,
    pub message: String,
    pub code: u16,
    pub body_summary: Option<String>,
    pub at: SystemTime,
}

/// Redacted error view for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub key: String,
    pub model: String,
    pub kind: &'static str,
    pub code: u16,
    pub message: String,
    pub at_unix: u64,
}

/// Fire-and-forget observation hooks fed by the dispatcher.
pub trait Observer: Send + Sync {
    fn on_request(&self, record: RequestRecord);
    fn on_error(&self, record: ErrorRecord);
}

/// Bounded in-memory log. Request records expire after 24 hours, error
/// records are capped by count.
pub struct MemoryLog {
    requests: Mutex<VecDeque<RequestRecord>>,
    errors: Mutex<VecDeque<ErrorRecord>>,
    max_errors: usize,
}

impl MemoryLog {
    pub fn new(max_errors: usize) -> Self {
        Self {
            requests: Mutex::new(VecDeque::new()),
            errors: Mutex::new(VecDeque::new()),
            max_errors,
        }
    }

    fn requests(&self) -> MutexGuard<'_, VecDeque<RequestRecord>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn errors(&self) -> MutexGuard<'_, VecDeque<ErrorRecord>> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prune_requests(queue: &mut VecDeque<RequestRecord>) {
        if let Some(cutoff) = SystemTime::now().checked_sub(REQUEST_RETENTION) {
            while queue.front().is_some_and(|r| r.at < cutoff) {
                queue.pop_front();
            }
        }
        while queue.len() > MAX_REQUEST_RECORDS {
            queue.pop_front();
        }
    }

    /// Per-model invocation counts for one key over the trailing 24 hours.
    pub fn key_usage_last_24h(&self, key: &str) -> BTreeMap<String, u64> {
        let mut queue = self.requests();
        Self::prune_requests(&mut queue);
        let mut usage = BTreeMap::new();
        for record in queue.iter().filter(|r| r.key == key) {
            *usage.entry(record.model.clone()).or_insert(0) += 1;
        }
        usage
    }

    /// Newest-first error summaries, keys redacted.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorSummary> {
        self.errors()
            .iter()
            .rev()
            .take(limit)
            .map(|record| ErrorSummary {
                key: redact(&record.key),
                model: record.model.clone(),
                kind: record.kind,
                code: record.code,
                message: record.message.clone(),
                at_unix: record
                    .at
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            })
            .collect()
    }

    /// Sweep expired request records.
    pub fn prune(&self) {
        Self::prune_requests(&mut self.requests());
    }

    /// Run the background pruner. Returns when `cancel` is triggered.
    pub async fn run_pruner(self: &std::sync::Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PRUNE_INTERVAL) => {},
                _ = cancel.cancelled() => {
                    info!("Log pruner shutting down");
                    return;
                }
            }
            self.prune();
        }
    }
}

impl Observer for MemoryLog {
    fn on_request(&self, record: RequestRecord) {
        debug!(
            model = %record.model,
            key = %redact(&record.key),
            success = record.success,
            status = record.status,
            latency_ms = record.latency_ms,
            "Request recorded"
        );
        let mut queue = self.requests();
        queue.push_back(record);
        Self::prune_requests(&mut queue);
    }

    fn on_error(&self, record: ErrorRecord) {
        let mut queue = self.errors();
        queue.push_back(record);
        while queue.len() > self.max_errors {
            queue.pop_front();
        }
    }
}
