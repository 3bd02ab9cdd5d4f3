//! HTTP client for the marketplace translate endpoint.
//! Pooled reqwest client; a 429 is folded into a rate-limited response so the
//! scheduler owns all retry and backoff decisions.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{TranslateBackend, TranslateError, TranslateRequest, TranslateResponse};

pub struct HttpBackend {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpBackend {
    /// `endpoint` is the full URL of `POST /api/translate`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()
            .map_err(|e| TranslateError::Network(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            timeout,
        })
    }
}

#[async_trait]
impl TranslateBackend for HttpBackend {
    async fn translate(&self, request: &TranslateRequest) -> Result<TranslateResponse, TranslateError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TranslateError::Timeout(self.timeout)
                } else {
                    TranslateError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let header_ms = retry_after_header_ms(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            let mut parsed = parse_body(&body).unwrap_or_default();
            parsed.rate_limited = true;
            if parsed.retry_after.is_none() {
                parsed.retry_after = header_ms;
            }
            warn!(retry_after_ms = ?parsed.retry_after, "translate endpoint returned 429");
            return Ok(parsed);
        }

        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(TranslateError::Network(format!(
                "unexpected status {}: {}",
                status,
                body_text.chars().take(200).collect::<String>()
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| TranslateError::Network(e.to_string()))?;
        let parsed = parse_body(&body)?;
        debug!(
            target_lang = %request.target_lang,
            rate_limited = parsed.rate_limited,
            "translate endpoint responded"
        );
        Ok(parsed)
    }
}

fn parse_body(body: &str) -> Result<TranslateResponse, TranslateError> {
    serde_json::from_str(body).map_err(|e| TranslateError::InvalidResponse(e.to_string()))
}

/// `Retry-After` in whole seconds, converted to milliseconds.
fn retry_after_header_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000))
}
