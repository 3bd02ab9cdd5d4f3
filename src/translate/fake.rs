//! Scripted in-process backend for tests and offline runs.
//! Replies are queued per source text; unscripted texts get a deterministic
//! `"[<lang>] <text>"` translation. Every call is recorded with its start time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{TranslateBackend, TranslateError, TranslateRequest, TranslateResponse};

#[derive(Debug, Clone)]
pub enum FakeReply {
    Translate(String),
    /// Successful response without `translatedText`.
    Missing,
    RateLimited { retry_after_ms: Option<u64> },
    Fail(String),
    /// Never answers.
    Hang,
}

#[derive(Debug, Clone)]
pub struct FakeCall {
    pub text: String,
    pub target_lang: String,
    pub started_at: Instant,
}

pub struct FakeBackend {
    replies: Mutex<HashMap<String, VecDeque<FakeReply>>>,
    calls: Mutex<Vec<FakeCall>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    call_count: AtomicU64,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl FakeBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            call_count: AtomicU64::new(0),
        }
    }

    /// Queue the next reply for `text`. Replies are consumed in order.
    pub fn push_reply(&self, text: &str, reply: FakeReply) {
        self.replies
            .lock()
            .entry(text.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &TranslateRequest) -> FakeReply {
        self.replies
            .lock()
            .get_mut(&request.text)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| FakeReply::Translate(format!("[{}] {}", request.target_lang, request.text)))
    }
}

#[async_trait]
impl TranslateBackend for FakeBackend {
    async fn translate(&self, request: &TranslateRequest) -> Result<TranslateResponse, TranslateError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(FakeCall {
            text: request.text.clone(),
            target_lang: request.target_lang.clone(),
            started_at: Instant::now(),
        });
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let _slot = InFlightSlot(&self.in_flight);

        let reply = self.next_reply(request);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match reply {
            FakeReply::Translate(text) => Ok(TranslateResponse::translated(text)),
            FakeReply::Missing => Ok(TranslateResponse::default()),
            FakeReply::RateLimited { retry_after_ms } => Ok(TranslateResponse::rate_limited(retry_after_ms)),
            FakeReply::Fail(msg) => Err(TranslateError::Network(msg)),
            FakeReply::Hang => std::future::pending().await,
        }
    }
}

/// Releases an in-flight slot even when the call future is dropped mid-way.
struct InFlightSlot<'a>(&'a AtomicUsize);

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
