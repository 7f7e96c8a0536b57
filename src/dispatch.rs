//! Retry dispatcher: drives upstream calls through the scheduler,
//! rotating keys across failed attempts.
//!
//! Every attempt failure is retryable; the loop stops once the retry
//! budget is spent and surfaces the last upstream status. Both pools
//! use the same loop, so the auxiliary pool rotates exactly like the
//! primary one. A streaming attempt restarts only while nothing has
//! been delivered downstream; after the first event a failure ends the
//! stream, so no byte is ever delivered twice.

use crate::error::Error;
use crate::metrics::METRICS;
use crate::observability::{ErrorRecord, Observer, RequestRecord};
use crate::scheduler::{redact, KeyScheduler};
use crate::upstream::{truncate, Upstream, UpstreamError};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Stored response summaries are cut to this many characters.
const SUMMARY_MAX_CHARS: usize = 500;
/// Buffered events between the retry loop and the downstream consumer.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Operation kind, used to tag error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Generate,
    StreamGenerate,
    CountTokens,
}

impl CallKind {
    fn label(self) -> &'static str {
        match self {
            CallKind::Generate => "chat",
            CallKind::StreamGenerate => "chat-stream",
            CallKind::CountTokens => "count-tokens",
        }
    }
}

/// Executes upstream calls for one pool, rotating keys on failure.
/// The retry cap itself lives in the scheduler: `on_failure` stops
/// handing out keys once the budget is spent.
#[derive(Clone)]
pub struct Dispatcher {
    upstream: Arc<dyn Upstream>,
    scheduler: Arc<KeyScheduler>,
    observer: Arc<dyn Observer>,
}

impl Dispatcher {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        scheduler: Arc<KeyScheduler>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            upstream,
            scheduler,
            observer,
        }
    }

    pub async fn generate(
        &self,
        model: &str,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, Error> {
        self.unary(CallKind::Generate, model, payload, cancel).await
    }

    pub async fn count_tokens(
        &self,
        model: &str,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, Error> {
        self.unary(CallKind::CountTokens, model, payload, cancel)
            .await
    }

    async fn unary(
        &self,
        kind: CallKind,
        model: &str,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, Error> {
        let mut key = self.scheduler.choose(model).ok_or(Error::Disabled)?;
        let mut attempt = 0u32;
        loop {
            // Cancellation short-circuits at attempt boundaries only.
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let started = Instant::now();
            let at = SystemTime::now();
            let result = if kind == CallKind::CountTokens {
                self.upstream.count_tokens(model, &key, payload).await
            } else {
                self.upstream.generate_content(model, &key, payload).await
            };

            match result {
                Ok(response) => {
                    self.record_success(kind, model, &key, &response, started, at);
                    return Ok(response);
                }
                Err(err) => {
                    warn!(
                        model,
                        key = %redact(&key),
                        attempt,
                        status = err.status,
                        "Upstream attempt failed"
                    );
                    self.record_failure(kind, model, &key, payload, &err, started, at);
                    attempt += 1;
                    match self.scheduler.on_failure(&key, attempt, model) {
                        Some(next) => {
                            METRICS.retries_total.fetch_add(1, Ordering::Relaxed);
                            info!(model, key = %redact(&next), attempt, "Rotated to next key");
                            key = next;
                        }
                        None => {
                            return Err(Error::Exhausted {
                                status: err.status,
                                attempts: attempt,
                            })
                        }
                    }
                }
            }
        }
    }

    /// Streamed generation with key rotation across failed attempts.
    pub fn stream_generate(
        &self,
        model: &str,
        payload: Value,
    ) -> impl Stream<Item = Result<Value, Error>> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let dispatcher = self.clone();
        let model = model.to_string();
        tokio::spawn(async move {
            dispatcher.run_stream(model, payload, tx).await;
        });
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }

    async fn run_stream(self, model: String, payload: Value, tx: mpsc::Sender<Result<Value, Error>>) {
        let Some(mut key) = self.scheduler.choose(&model) else {
            let _ = tx.send(Err(Error::Disabled)).await;
            return;
        };

        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let at = SystemTime::now();
            let mut delivered = false;

            match self
                .stream_attempt(&model, &key, &payload, &tx, &mut delivered)
                .await
            {
                Ok(()) => {
                    self.observer.on_request(RequestRecord {
                        model: model.clone(),
                        key: key.clone(),
                        success: true,
                        status: 200,
                        latency_ms: started.elapsed().as_millis() as u64,
                        at,
                        body_summary: Some("[streaming response]".into()),
                        prompt_tokens: None,
                        completion_tokens: None,
                        total_tokens: None,
                        error: None,
                    });
                    return;
                }
                Err(err) => {
                    warn!(
                        model = %model,
                        key = %redact(&key),
                        attempt,
                        status = err.status,
                        delivered,
                        "Streaming attempt failed"
                    );
                    self.record_failure(
                        CallKind::StreamGenerate,
                        &model,
                        &key,
                        &payload,
                        &err,
                        started,
                        at,
                    );

                    if delivered {
                        // Bytes already reached the consumer: restarting
                        // would double-deliver, so the stream ends here.
                        let _ = tx
                            .send(Err(Error::Upstream {
                                status: err.status,
                                message: err.message,
                            }))
                            .await;
                        return;
                    }

                    attempt += 1;
                    match self.scheduler.on_failure(&key, attempt, &model) {
                        Some(next) => {
                            METRICS.retries_total.fetch_add(1, Ordering::Relaxed);
                            info!(model = %model, key = %redact(&next), attempt, "Rotated to next key");
                            key = next;
                        }
                        None => {
                            let _ = tx
                                .send(Err(Error::Exhausted {
                                    status: err.status,
                                    attempts: attempt,
                                }))
                                .await;
                            return;
                        }
                    }
                }
            }

            // Consumer gone: stop at the attempt boundary.
            if tx.is_closed() {
                return;
            }
        }
    }

    async fn stream_attempt(
        &self,
        model: &str,
        key: &str,
        payload: &Value,
        tx: &mpsc::Sender<Result<Value, Error>>,
        delivered: &mut bool,
    ) -> Result<(), UpstreamError> {
        let mut events = self
            .upstream
            .stream_generate_content(model, key, payload)
            .await?;
        while let Some(event) = events.next().await {
            let event = event?;
            if tx.send(Ok(event)).await.is_err() {
                // Receiver dropped; nothing more to deliver.
                return Ok(());
            }
            *delivered = true;
        }
        Ok(())
    }

    // --- Observation records ---

    #[allow(clippy::too_many_arguments)]
    fn record_success(
        &self,
        _kind: CallKind,
        model: &str,
        key: &str,
        response: &Value,
        started: Instant,
        at: SystemTime,
    ) {
        let (prompt_tokens, completion_tokens, total_tokens) = token_counts(response);
        self.observer.on_request(RequestRecord {
            model: model.to_string(),
            key: key.to_string(),
            success: true,
            status: 200,
            latency_ms: started.elapsed().as_millis() as u64,
            at,
            body_summary: response_summary(response),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            error: None,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn record_failure(
        &self,
        kind: CallKind,
        model: &str,
        key: &str,
        payload: &Value,
        err: &UpstreamError,
        started: Instant,
        at: SystemTime,
    ) {
        METRICS.upstream_errors.fetch_add(1, Ordering::Relaxed);
        self.observer.on_error(ErrorRecord {
            key: key.to_string(),
            model: model.to_string(),
            kind: kind.label(),
            message: err.message.clone(),
            code: err.status,
            body_summary: Some(truncate(&payload.to_string(), SUMMARY_MAX_CHARS)),
            at,
        });
        self.observer.on_request(RequestRecord {
            model: model.to_string(),
            key: key.to_string(),
            success: false,
            status: err.status,
            latency_ms: started.elapsed().as_millis() as u64,
            at,
            body_summary: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            error: Some(err.message.clone()),
        });
    }
}

/// Token usage from a generate response, when the upstream reported it.
fn token_counts(response: &Value) -> (Option<u64>, Option<u64>, Option<u64>) {
    let usage = response.get("usageMetadata");
    let field = |name: &str| usage.and_then(|u| u.get(name)).and_then(Value::as_u64);
    (
        field("promptTokenCount"),
        field("candidatesTokenCount"),
        field("totalTokenCount"),
    )
}

/// First candidate text, truncated, for the request log.
fn response_summary(response: &Value) -> Option<String> {
    let text = response
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()?;
    Some(truncate(text, SUMMARY_MAX_CHARS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemoryLog;
    use crate::scheduler::tests::make_scheduler_full;
    use crate::upstream::EventStream;
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const MODEL: &str = "gemini-flash";

    fn ok_response() -> Value {
        json!({
            "candidates": [{"content": {"parts": [{"text": "hello"}]}}],
            "usageMetadata": {
                "promptTokenCount": 1,
                "candidatesTokenCount": 2,
                "totalTokenCount": 3
            }
        })
    }

    /// Fails the first `failures` unary calls, then succeeds.
    struct ScriptedUpstream {
        failures: u32,
        status: u16,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedUpstream {
        fn new(failures: u32, status: u16) -> Self {
            Self {
                failures,
                status,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn keys_seen(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn generate_content(
            &self,
            _model: &str,
            key: &str,
            _payload: &Value,
        ) -> Result<Value, UpstreamError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(key.to_string());
            if calls.len() as u32 <= self.failures {
                Err(UpstreamError {
                    status: self.status,
                    message: "scripted failure".into(),
                })
            } else {
                Ok(ok_response())
            }
        }

        async fn count_tokens(
            &self,
            _model: &str,
            key: &str,
            _payload: &Value,
        ) -> Result<Value, UpstreamError> {
            self.calls.lock().unwrap().push(key.to_string());
            Ok(json!({"totalTokens": 42}))
        }

        async fn stream_generate_content(
            &self,
            _model: &str,
            _key: &str,
            _payload: &Value,
        ) -> Result<EventStream, UpstreamError> {
            Err(UpstreamError::transport("not scripted"))
        }
    }

    enum StreamScript {
        OpenError(u16),
        Events(Vec<Result<Value, UpstreamError>>),
    }

    /// Plays one script entry per streaming attempt.
    struct ScriptedStreamUpstream {
        attempts: Mutex<VecDeque<StreamScript>>,
        keys: Mutex<Vec<String>>,
    }

    impl ScriptedStreamUpstream {
        fn new(attempts: Vec<StreamScript>) -> Self {
            Self {
                attempts: Mutex::new(attempts.into()),
                keys: Mutex::new(Vec::new()),
            }
        }

        fn keys_seen(&self) -> Vec<String> {
            self.keys.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Upstream for ScriptedStreamUpstream {
        async fn generate_content(
            &self,
            _model: &str,
            _key: &str,
            _payload: &Value,
        ) -> Result<Value, UpstreamError> {
            Err(UpstreamError::transport("not scripted"))
        }

        async fn count_tokens(
            &self,
            _model: &str,
            _key: &str,
            _payload: &Value,
        ) -> Result<Value, UpstreamError> {
            Err(UpstreamError::transport("not scripted"))
        }

        async fn stream_generate_content(
            &self,
            _model: &str,
            key: &str,
            _payload: &Value,
        ) -> Result<EventStream, UpstreamError> {
            self.keys.lock().unwrap().push(key.to_string());
            match self.attempts.lock().unwrap().pop_front() {
                Some(StreamScript::Events(events)) => Ok(stream::iter(events).boxed()),
                Some(StreamScript::OpenError(status)) => Err(UpstreamError {
                    status,
                    message: "scripted open failure".into(),
                }),
                None => Err(UpstreamError::transport("script exhausted")),
            }
        }
    }

    fn make_dispatcher(
        upstream: Arc<dyn Upstream>,
        names: &[&str],
        max_retries: u32,
    ) -> (Dispatcher, Arc<KeyScheduler>, Arc<MemoryLog>) {
        let (scheduler, _) = make_scheduler_full(names, &[(MODEL, 100)], true, 3, max_retries);
        let scheduler = Arc::new(scheduler);
        let log = Arc::new(MemoryLog::new(64));
        let dispatcher = Dispatcher::new(
            upstream,
            Arc::clone(&scheduler),
            Arc::clone(&log) as Arc<dyn Observer>,
        );
        (dispatcher, scheduler, log)
    }

    // --- Unary ---

    #[tokio::test]
    async fn test_generate_rotates_until_success() {
        let upstream = Arc::new(ScriptedUpstream::new(2, 500));
        let (dispatcher, scheduler, log) =
            make_dispatcher(Arc::clone(&upstream) as Arc<dyn Upstream>, &["a", "b", "c"], 3);

        let cancel = CancellationToken::new();
        let response = dispatcher
            .generate(MODEL, &json!({}), &cancel)
            .await
            .unwrap();
        assert_eq!(response["usageMetadata"]["totalTokenCount"], 3);

        assert_eq!(upstream.keys_seen(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.failure_count("a"), 1);
        assert_eq!(scheduler.failure_count("b"), 1);
        assert_eq!(scheduler.failure_count("c"), 0);
        assert_eq!(log.recent_errors(10).len(), 2);
    }

    #[tokio::test]
    async fn test_generate_exhausts_retry_budget() {
        let upstream = Arc::new(ScriptedUpstream::new(u32::MAX, 503));
        let (dispatcher, scheduler, _) =
            make_dispatcher(Arc::clone(&upstream) as Arc<dyn Upstream>, &["a", "b"], 2);

        let cancel = CancellationToken::new();
        let err = dispatcher
            .generate(MODEL, &json!({}), &cancel)
            .await
            .unwrap_err();
        match err {
            Error::Exhausted { status, attempts } => {
                assert_eq!(status, 503);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected Exhausted, got {other}"),
        }
        assert_eq!(upstream.keys_seen().len(), 2);
        assert_eq!(scheduler.failure_count("a"), 1);
        assert_eq!(scheduler.failure_count("b"), 1);
    }

    #[tokio::test]
    async fn test_generate_empty_pool_is_disabled() {
        let upstream = Arc::new(ScriptedUpstream::new(0, 500));
        let (dispatcher, _, _) = make_dispatcher(upstream, &[], 3);
        let cancel = CancellationToken::new();
        let err = dispatcher
            .generate(MODEL, &json!({}), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disabled));
    }

    #[tokio::test]
    async fn test_generate_cancelled_before_attempt() {
        let upstream = Arc::new(ScriptedUpstream::new(0, 500));
        let (dispatcher, _, _) =
            make_dispatcher(Arc::clone(&upstream) as Arc<dyn Upstream>, &["a"], 3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dispatcher
            .generate(MODEL, &json!({}), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(upstream.keys_seen().is_empty());
    }

    #[tokio::test]
    async fn test_count_tokens_passthrough() {
        let upstream = Arc::new(ScriptedUpstream::new(0, 500));
        let (dispatcher, _, _) =
            make_dispatcher(Arc::clone(&upstream) as Arc<dyn Upstream>, &["a"], 3);
        let cancel = CancellationToken::new();
        let response = dispatcher
            .count_tokens(MODEL, &json!({}), &cancel)
            .await
            .unwrap();
        assert_eq!(response["totalTokens"], 42);
    }

    #[tokio::test]
    async fn test_success_record_carries_token_usage() {
        struct Capture(Mutex<Vec<RequestRecord>>);
        impl Observer for Capture {
            fn on_request(&self, record: RequestRecord) {
                self.0.lock().unwrap().push(record);
            }
            fn on_error(&self, _record: ErrorRecord) {}
        }

        let upstream = Arc::new(ScriptedUpstream::new(0, 500));
        let (scheduler, _) = make_scheduler_full(&["a"], &[(MODEL, 100)], true, 3, 3);
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let dispatcher = Dispatcher::new(
            upstream,
            Arc::new(scheduler),
            Arc::clone(&capture) as Arc<dyn Observer>,
        );

        dispatcher
            .generate(MODEL, &json!({}), &CancellationToken::new())
            .await
            .unwrap();

        let records = capture.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].status, 200);
        assert_eq!(records[0].total_tokens, Some(3));
        assert_eq!(records[0].body_summary.as_deref(), Some("hello"));
    }

    // --- Streaming ---

    #[tokio::test]
    async fn test_stream_retries_before_first_delivery() {
        let upstream = Arc::new(ScriptedStreamUpstream::new(vec![
            StreamScript::OpenError(503),
            StreamScript::Events(vec![Ok(json!({"n": 1})), Ok(json!({"n": 2}))]),
        ]));
        let (dispatcher, scheduler, _) =
            make_dispatcher(Arc::clone(&upstream) as Arc<dyn Upstream>, &["a", "b"], 3);

        let items: Vec<_> = dispatcher
            .stream_generate(MODEL, json!({}))
            .collect::<Vec<_>>()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap()["n"], 1);
        assert_eq!(items[1].as_ref().unwrap()["n"], 2);

        let keys = upstream.keys_seen();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
        assert_eq!(scheduler.failure_count(&keys[0]), 1);
    }

    #[tokio::test]
    async fn test_stream_mid_failure_after_delivery_terminates() {
        let upstream = Arc::new(ScriptedStreamUpstream::new(vec![StreamScript::Events(
            vec![
                Ok(json!({"n": 1})),
                Err(UpstreamError {
                    status: 500,
                    message: "mid-stream".into(),
                }),
            ],
        )]));
        let (dispatcher, _, _) =
            make_dispatcher(Arc::clone(&upstream) as Arc<dyn Upstream>, &["a", "b"], 3);

        let items: Vec<_> = dispatcher
            .stream_generate(MODEL, json!({}))
            .collect::<Vec<_>>()
            .await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(Error::Upstream { status: 500, .. })));
        // No retry once output reached the consumer.
        assert_eq!(upstream.keys_seen().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_exhausts_retry_budget() {
        let upstream = Arc::new(ScriptedStreamUpstream::new(vec![
            StreamScript::OpenError(429),
            StreamScript::OpenError(429),
        ]));
        let (dispatcher, _, _) =
            make_dispatcher(Arc::clone(&upstream) as Arc<dyn Upstream>, &["a", "b"], 2);

        let items: Vec<_> = dispatcher
            .stream_generate(MODEL, json!({}))
            .collect::<Vec<_>>()
            .await;

        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(Error::Exhausted {
                status: 429,
                attempts: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_stream_empty_pool_is_disabled() {
        let upstream = Arc::new(ScriptedStreamUpstream::new(vec![]));
        let (dispatcher, _, _) = make_dispatcher(upstream, &[], 3);
        let items: Vec<_> = dispatcher
            .stream_generate(MODEL, json!({}))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(Error::Disabled)));
    }
}
