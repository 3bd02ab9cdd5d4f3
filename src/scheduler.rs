//! Translation scheduler: one priority queue drained by a single background task.
//!
//! Callers `schedule` a text for a language and await the result. Cache hits
//! resolve immediately; misses are queued (lower priority value first, stable
//! on ties) and dispatched under a global concurrency cap and a minimum
//! spacing between dispatches. Rate-limit responses start a cooldown, double
//! the backoff and put the request back at the front of the queue.
//!
//! The loop sleeps on a `Notify` signalled by enqueue, completion, language
//! switch and shutdown, or on the deadline of whichever gate is holding it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::{metric_names, MetricsRegistry};
use crate::translate::cache::{translation_key, PersistentCache};
use crate::translate::{TranslateBackend, TranslateError, TranslateRequest, SOURCE_LANGUAGE};

pub const MAX_CONCURRENT_REQUESTS: usize = 2;
pub const REQUEST_INTERVAL_MS: u64 = 500;
pub const MAX_RETRIES: u32 = 3;
pub const BACKOFF_INITIAL_MS: u64 = 1_000;
pub const BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_RETRY_AFTER_MS: u64 = 10_000;
pub const DEFAULT_PRIORITY: i32 = 50;
pub const QUEUE_POLL_MS: u64 = 100;
pub const LANGUAGE_BOOST_MAX: i32 = 40;
pub const LANGUAGE_BOOST_WINDOW_MS: u64 = 5_000;
pub const REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Priority bonus for a request re-queued after a rate limit.
const RATE_LIMIT_RETRY_BOOST: i32 = 10;
/// Priority bonus for a request re-queued after a network failure.
const FAILURE_RETRY_BOOST: i32 = 5;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_requests: usize,
    pub request_interval: Duration,
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub default_retry_after: Duration,
    pub queue_poll: Duration,
    pub language_boost_max: i32,
    pub language_boost_window: Duration,
    /// Upper bound on one backend call; exceeding it counts as a network failure.
    pub request_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: MAX_CONCURRENT_REQUESTS,
            request_interval: Duration::from_millis(REQUEST_INTERVAL_MS),
            max_retries: MAX_RETRIES,
            backoff_initial: Duration::from_millis(BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(BACKOFF_MAX_MS),
            default_retry_after: Duration::from_millis(DEFAULT_RETRY_AFTER_MS),
            queue_poll: Duration::from_millis(QUEUE_POLL_MS),
            language_boost_max: LANGUAGE_BOOST_MAX,
            language_boost_window: Duration::from_millis(LANGUAGE_BOOST_WINDOW_MS),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
        }
    }
}

/// A queued translation. Owned by the queue until dispatched; the reply
/// channel is consumed exactly once.
struct TranslationRequest {
    id: Uuid,
    text: String,
    target_lang: String,
    priority: i32,
    retries: u32,
    enqueued_at: Instant,
    reply: oneshot::Sender<Result<String, TranslateError>>,
}

impl TranslationRequest {
    fn resolve(self, result: Result<String, TranslateError>) {
        // The caller may have gone away; nothing to do then.
        let _ = self.reply.send(result);
    }

    /// Resolve with the untranslated source text.
    fn resolve_with_source(self) {
        let text = self.text.clone();
        self.resolve(Ok(text));
    }
}

/// What the loop should do next.
enum Step {
    Dispatch(TranslationRequest),
    WaitUntil(Instant),
    Idle,
}

/// All mutable scheduler state. One instance per scheduler.
pub struct SchedulerState {
    queue: Vec<TranslationRequest>,
    active_requests: usize,
    rate_limit_hit: bool,
    rate_limit_reset: Option<Instant>,
    backoff: Duration,
    last_request: Option<Instant>,
    /// Earliest next pass after a completion; lifted by a new enqueue.
    hold_until: Option<Instant>,
    current_language: Option<String>,
    last_language_change: Option<Instant>,
}

impl SchedulerState {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            queue: Vec::new(),
            active_requests: 0,
            rate_limit_hit: false,
            rate_limit_reset: None,
            backoff: config.backoff_initial,
            last_request: None,
            hold_until: None,
            current_language: None,
            last_language_change: None,
        }
    }

    /// Append and re-sort. `sort_by_key` is stable, so equal priorities keep
    /// insertion order.
    fn enqueue(&mut self, request: TranslationRequest) {
        self.queue.push(request);
        self.queue.sort_by_key(|r| r.priority);
    }

    fn requeue_front(&mut self, request: TranslationRequest) {
        self.queue.insert(0, request);
    }

    /// Record `lang` as the current language. Returns the queued requests to
    /// flush when this is a switch away from a previously seen language.
    /// The first language ever seen is adopted without a switch.
    fn observe_language(&mut self, lang: &str, now: Instant) -> Vec<TranslationRequest> {
        match self.current_language.as_deref() {
            Some(current) if current == lang => Vec::new(),
            None => {
                self.current_language = Some(lang.to_string());
                Vec::new()
            }
            Some(_) => self.switch_language(lang, now),
        }
    }

    fn switch_language(&mut self, lang: &str, now: Instant) -> Vec<TranslationRequest> {
        self.current_language = Some(lang.to_string());
        self.last_language_change = Some(now);
        self.queue.drain(..).collect()
    }

    /// Caller priority minus a boost that decays linearly to zero over the
    /// window after a language switch. Boosted values never drop below 1.
    fn effective_priority(&self, priority: i32, now: Instant, config: &SchedulerConfig) -> i32 {
        let Some(changed_at) = self.last_language_change else {
            return priority;
        };
        let elapsed = now.saturating_duration_since(changed_at);
        if elapsed >= config.language_boost_window || config.language_boost_window.is_zero() {
            return priority;
        }
        let remaining = 1.0 - elapsed.as_secs_f64() / config.language_boost_window.as_secs_f64();
        let boost = (config.language_boost_max as f64 * remaining).round() as i32;
        (priority - boost).max(1)
    }

    /// One pass of queue processing.
    fn next_step(&mut self, now: Instant, config: &SchedulerConfig) -> Step {
        if let Some(reset) = self.rate_limit_reset {
            if now < reset {
                return Step::WaitUntil(reset);
            }
            self.rate_limit_reset = None;
            if self.rate_limit_hit {
                self.rate_limit_hit = false;
                info!("rate limit cooldown elapsed");
            }
        }

        if self.queue.is_empty() {
            return Step::Idle;
        }

        if let Some(hold) = self.hold_until {
            if now < hold {
                return Step::WaitUntil(hold);
            }
            self.hold_until = None;
        }

        if self.active_requests >= config.max_concurrent_requests {
            return Step::WaitUntil(now + config.queue_poll);
        }

        if let Some(last) = self.last_request {
            let next_allowed = last + config.request_interval;
            if now < next_allowed {
                return Step::WaitUntil(next_allowed);
            }
        }

        let request = self.queue.remove(0);
        self.active_requests += 1;
        self.last_request = Some(now);
        Step::Dispatch(request)
    }
}

/// Point-in-time view of the scheduler, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub active_requests: usize,
    pub rate_limited: bool,
    pub backoff_ms: u64,
    pub current_language: Option<String>,
}

/// How a dispatched request finished.
enum Completion {
    Requeued,
    Resolve(TranslationRequest, Result<String, TranslateError>),
    Translated(TranslationRequest, String),
}

struct Inner {
    state: Mutex<SchedulerState>,
    wake: Notify,
    cache: Arc<PersistentCache>,
    backend: Arc<dyn TranslateBackend>,
    metrics: Arc<MetricsRegistry>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

/// Handle to a running scheduler. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Build the scheduler and spawn its processing loop on the current runtime.
    pub fn spawn(
        config: SchedulerConfig,
        cache: Arc<PersistentCache>,
        backend: Arc<dyn TranslateBackend>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        cache.init();
        let inner = Arc::new(Inner {
            state: Mutex::new(SchedulerState::new(&config)),
            wake: Notify::new(),
            cache,
            backend,
            metrics,
            config,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(run_loop(Arc::clone(&inner)));
        info!("translation scheduler started");
        Self { inner }
    }

    /// Translate `text` into `target_lang`.
    ///
    /// Empty text and the source language return `text` untouched. A rate
    /// limit that outlasts every retry resolves with `text`; a network failure
    /// that outlasts every retry is returned as an error.
    pub async fn schedule(
        &self,
        text: &str,
        target_lang: &str,
        priority: i32,
    ) -> Result<String, TranslateError> {
        if text.is_empty() || target_lang == SOURCE_LANGUAGE {
            return Ok(text.to_string());
        }

        match self.enqueue(text, target_lang, priority)? {
            Enqueued::Cached(value) => Ok(value),
            Enqueued::Pending(rx) => rx.await.unwrap_or(Err(TranslateError::Shutdown)),
        }
    }

    /// `schedule` with the fallback policy applied: any error yields the
    /// source text. Translation is an enhancement, never a rendering dependency.
    pub async fn schedule_or_fallback(&self, text: &str, target_lang: &str, priority: i32) -> String {
        match self.schedule(text, target_lang, priority).await {
            Ok(translated) => translated,
            Err(e) => {
                warn!(error = %e, target_lang, "translation failed, falling back to source text");
                text.to_string()
            }
        }
    }

    /// Explicit language switch (e.g. from the language picker), including a
    /// switch back to the source language. Queued work is resolved with its
    /// source text.
    pub fn set_language(&self, lang: &str) {
        let flushed = {
            let mut state = self.inner.state.lock();
            if state.current_language.as_deref() == Some(lang) {
                return;
            }
            state.switch_language(lang, Instant::now())
        };
        self.inner.flush(flushed, lang);
        self.inner.wake.notify_one();
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            queued: state.queue.len(),
            active_requests: state.active_requests,
            rate_limited: state.rate_limit_hit,
            backoff_ms: state.backoff.as_millis() as u64,
            current_language: state.current_language.clone(),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    pub fn cache(&self) -> &Arc<PersistentCache> {
        &self.inner.cache
    }

    /// Stop the loop. Queued requests resolve with their source text; later
    /// `schedule` calls fail with `TranslateError::Shutdown`.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.wake.notify_one();
    }

    fn enqueue(&self, text: &str, target_lang: &str, priority: i32) -> Result<Enqueued, TranslateError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(TranslateError::Shutdown);
        }

        let now = Instant::now();
        let (flushed, priority) = {
            let mut state = inner.state.lock();
            let flushed = state.observe_language(target_lang, now);
            let priority = state.effective_priority(priority, now, &inner.config);
            (flushed, priority)
        };
        if !flushed.is_empty() {
            inner.flush(flushed, target_lang);
        }

        if let Some(value) = inner.cache.get(&translation_key(text, target_lang)) {
            inner.metrics.incr(metric_names::CACHE_HIT);
            debug!(target_lang, "translation cache hit");
            return Ok(Enqueued::Cached(value));
        }
        inner.metrics.incr(metric_names::CACHE_MISS);

        let (tx, rx) = oneshot::channel();
        let request = TranslationRequest {
            id: Uuid::new_v4(),
            text: text.to_string(),
            target_lang: target_lang.to_string(),
            priority,
            retries: 0,
            enqueued_at: now,
            reply: tx,
        };
        {
            let mut state = inner.state.lock();
            // Re-checked under the lock: after shutdown the loop drains under it
            // once and never again.
            if inner.shutdown.is_cancelled() {
                return Err(TranslateError::Shutdown);
            }
            debug!(id = %request.id, priority, target_lang, "translation queued");
            state.enqueue(request);
            state.hold_until = None;
        }
        inner.wake.notify_one();
        Ok(Enqueued::Pending(rx))
    }
}

enum Enqueued {
    Cached(String),
    Pending(oneshot::Receiver<Result<String, TranslateError>>),
}

impl Inner {
    fn flush(&self, flushed: Vec<TranslationRequest>, new_lang: &str) {
        if flushed.is_empty() {
            return;
        }
        info!(count = flushed.len(), new_lang, "language changed, flushing queued translations");
        for request in flushed {
            self.metrics.incr(metric_names::FLUSHED);
            request.resolve_with_source();
        }
    }

    /// One backend call for one dequeued request, then bookkeeping.
    async fn process_request(self: Arc<Self>, mut request: TranslationRequest) {
        let config = &self.config;
        let started = Instant::now();
        self.metrics.record(
            metric_names::QUEUE_WAIT,
            started.duration_since(request.enqueued_at).as_micros() as f64,
        );
        self.metrics.incr(metric_names::DISPATCHED);
        debug!(id = %request.id, retries = request.retries, "dispatching translation");

        let wire = TranslateRequest {
            text: request.text.clone(),
            target_lang: request.target_lang.clone(),
        };
        let result = match tokio::time::timeout(config.request_timeout, self.backend.translate(&wire)).await {
            Ok(result) => result,
            Err(_) => Err(TranslateError::Timeout(config.request_timeout)),
        };

        let now = Instant::now();
        let completion = {
            let mut state = self.state.lock();
            // Under the lock, so a requeue seen as live is still drained by the loop.
            let shutting_down = self.shutdown.is_cancelled();
            state.active_requests = state.active_requests.saturating_sub(1);

            let (completion, rate_limited) = match result {
                Ok(resp) if resp.rate_limited => {
                    let retry_after = resp
                        .retry_after
                        .map(Duration::from_millis)
                        .unwrap_or(config.default_retry_after)
                        .min(config.backoff_max);
                    state.rate_limit_hit = true;
                    state.rate_limit_reset = Some(now + retry_after);
                    state.backoff = (state.backoff * 2).min(config.backoff_max);
                    self.metrics.incr(metric_names::RATE_LIMITED);
                    warn!(
                        id = %request.id,
                        retry_after_ms = retry_after.as_millis() as u64,
                        backoff_ms = state.backoff.as_millis() as u64,
                        retries = request.retries,
                        "translation rate limited"
                    );

                    let completion = if request.retries < config.max_retries && !shutting_down {
                        request.retries += 1;
                        request.priority -= RATE_LIMIT_RETRY_BOOST;
                        self.metrics.incr(metric_names::RETRIED);
                        state.requeue_front(request);
                        Completion::Requeued
                    } else {
                        let text = request.text.clone();
                        Completion::Resolve(request, Ok(text))
                    };
                    (completion, true)
                }
                Ok(resp) => {
                    let translated = resp.translated_text.unwrap_or_else(|| request.text.clone());
                    state.backoff = (state.backoff / 2).max(config.backoff_initial);
                    (Completion::Translated(request, translated), false)
                }
                Err(e) => {
                    let completion = if request.retries < config.max_retries && !shutting_down {
                        warn!(id = %request.id, error = %e, retries = request.retries, "translation failed, retrying");
                        request.retries += 1;
                        request.priority -= FAILURE_RETRY_BOOST;
                        self.metrics.incr(metric_names::RETRIED);
                        state.requeue_front(request);
                        Completion::Requeued
                    } else {
                        error!(id = %request.id, error = %e, "translation failed, retries exhausted");
                        self.metrics.incr(metric_names::FAILED);
                        Completion::Resolve(request, Err(e))
                    };
                    (completion, false)
                }
            };

            let hold = if rate_limited {
                state.backoff
            } else {
                config.request_interval
            };
            state.hold_until = Some(now + hold);
            completion
        };

        match completion {
            Completion::Requeued => {}
            Completion::Resolve(request, result) => request.resolve(result),
            Completion::Translated(request, translated) => {
                if translated != request.text {
                    self.cache
                        .set(&translation_key(&request.text, &request.target_lang), &translated);
                }
                self.metrics.record(
                    metric_names::TRANSLATE_DONE,
                    now.duration_since(started).as_micros() as f64,
                );
                debug!(id = %request.id, "translation resolved");
                request.resolve(Ok(translated));
            }
        }

        self.wake.notify_one();
    }
}

async fn run_loop(inner: Arc<Inner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        let step = {
            let mut state = inner.state.lock();
            state.next_step(Instant::now(), &inner.config)
        };

        match step {
            Step::Dispatch(request) => {
                tokio::spawn(Arc::clone(&inner).process_request(request));
            }
            Step::WaitUntil(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = inner.wake.notified() => {}
                    _ = inner.shutdown.cancelled() => break,
                }
            }
            Step::Idle => {
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    _ = inner.shutdown.cancelled() => break,
                }
            }
        }
    }

    // Drained under the state lock; enqueue and requeue re-check shutdown under it.
    let pending: Vec<TranslationRequest> = inner.state.lock().queue.drain(..).collect();
    if !pending.is_empty() {
        info!(count = pending.len(), "scheduler stopping, resolving queued translations with source text");
    }
    for request in pending {
        request.resolve_with_source();
    }
    info!("translation scheduler stopped");
}
