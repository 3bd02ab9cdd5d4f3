//! Translation wire types, errors and the backend seam.
//! The scheduler talks to a `TranslateBackend`; production uses the HTTP
//! client for `POST /api/translate`, tests use `FakeBackend`.

pub mod cache;
pub mod fake;
pub mod http;
pub mod sqlite_storage;
pub mod storage;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Language the marketplace content is authored in. Requests for it never leave the process.
pub const SOURCE_LANGUAGE: &str = "en";

/// Body of `POST /api/translate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequest {
    pub text: String,
    pub target_lang: String,
}

/// Response of `POST /api/translate`. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
    #[serde(default)]
    pub rate_limited: bool,
    /// Cooldown requested by the provider, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl TranslateResponse {
    pub fn translated(text: impl Into<String>) -> Self {
        Self {
            translated_text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn rate_limited(retry_after_ms: Option<u64>) -> Self {
        Self {
            translated_text: None,
            rate_limited: true,
            retry_after: retry_after_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("translation timeout after {0:?}")]
    Timeout(Duration),
    #[error("translation scheduler shut down")]
    Shutdown,
}

/// One call to the translation provider. Rate limiting is reported in the
/// response, not as an error; errors are transport or decoding failures.
#[async_trait]
pub trait TranslateBackend: Send + Sync {
    async fn translate(&self, request: &TranslateRequest) -> Result<TranslateResponse, TranslateError>;
}
