//! User language preference.
//! Persisted under the `userLanguage` storage key and mirrored in a cookie of
//! the same name so page loads can pick it up. Changes are published on a
//! watch channel that mounted `TranslatedText`s follow, and forwarded to the
//! scheduler so stale queued work is flushed.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::scheduler::Scheduler;
use crate::translate::storage::KeyValueStorage;
use crate::translate::SOURCE_LANGUAGE;

pub const LANGUAGE_STORAGE_KEY: &str = "userLanguage";
pub const LANGUAGE_COOKIE_NAME: &str = "userLanguage";
/// One year.
pub const LANGUAGE_COOKIE_MAX_AGE_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LanguageError {
    #[error("invalid language code: {0:?}")]
    InvalidCode(String),
}

/// Lower-cased code if it looks like `ja`, `pt-br`, `zh-hant`; `None` otherwise.
pub fn normalize_code(code: &str) -> Option<String> {
    let code = code.trim().to_ascii_lowercase();
    let valid = !code.is_empty()
        && code.len() <= 16
        && code.split('-').all(|part| {
            !part.is_empty() && part.len() <= 8 && part.chars().all(|c| c.is_ascii_alphanumeric())
        });
    valid.then_some(code)
}

pub struct LanguagePreference {
    storage: Arc<dyn KeyValueStorage>,
    tx: watch::Sender<String>,
    scheduler: Option<Scheduler>,
}

impl LanguagePreference {
    /// Read the stored preference; falls back to the source language.
    pub fn load(storage: Arc<dyn KeyValueStorage>) -> Self {
        let current = match storage.get_item(LANGUAGE_STORAGE_KEY) {
            Ok(Some(raw)) => normalize_code(&raw).unwrap_or_else(|| {
                warn!(stored = %raw, "stored language preference invalid, using default");
                SOURCE_LANGUAGE.to_string()
            }),
            Ok(None) => SOURCE_LANGUAGE.to_string(),
            Err(e) => {
                warn!(error = %e, "language preference load failed, using default");
                SOURCE_LANGUAGE.to_string()
            }
        };
        let (tx, _) = watch::channel(current);
        Self {
            storage,
            tx,
            scheduler: None,
        }
    }

    /// Forward future changes to `scheduler`.
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn current(&self) -> String {
        self.tx.borrow().clone()
    }

    /// Receiver to hand to `TranslatedText::mount`.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }

    /// Switch language. Persisting is best-effort; the switch always takes effect.
    pub fn set(&self, code: &str) -> Result<(), LanguageError> {
        let code = normalize_code(code).ok_or_else(|| LanguageError::InvalidCode(code.to_string()))?;

        if let Err(e) = self.storage.set_item(LANGUAGE_STORAGE_KEY, &code) {
            warn!(error = %e, "language preference not persisted");
        }

        let changed = self.tx.send_if_modified(|current| {
            if *current == code {
                false
            } else {
                *current = code.clone();
                true
            }
        });
        if changed {
            info!(language = %code, "language changed");
            if let Some(scheduler) = &self.scheduler {
                scheduler.set_language(&code);
            }
        }
        Ok(())
    }

    /// `Set-Cookie` value mirroring the current preference.
    pub fn cookie_header(&self) -> String {
        format!(
            "{LANGUAGE_COOKIE_NAME}={}; Max-Age={LANGUAGE_COOKIE_MAX_AGE_SECS}; Path=/; SameSite=Lax",
            self.current()
        )
    }

    /// `userLanguage` value from a `Cookie:` request header.
    pub fn from_cookie_header(header: &str) -> Option<String> {
        header
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| name.trim() == LANGUAGE_COOKIE_NAME)
            .and_then(|(_, value)| normalize_code(value))
    }
}
