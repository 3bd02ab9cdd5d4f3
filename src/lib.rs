//! jdm-translate: translation subsystem for the JDM marketplace.
//! Persistent TTL cache, prioritized and rate-limit aware request scheduler,
//! reactive per-string bindings and the user language preference.

pub mod cancellation;
pub mod clock;
pub mod config;
pub mod language;
pub mod metrics;
pub mod scheduler;
pub mod state_machine;
pub mod translate;
pub mod translated_text;

use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use config::{Config, ConfigError};
pub use language::LanguagePreference;
pub use metrics::MetricsRegistry;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use translate::cache::{CacheConfig, PersistentCache};
pub use translate::{TranslateBackend, TranslateError};
pub use translated_text::{TextConfig, TranslatedText};

use clock::SystemClock;
use language::LanguageError;
use scheduler::DEFAULT_PRIORITY;
use translate::cache::CLEANUP_INTERVAL;
use translate::http::HttpBackend;
use translate::sqlite_storage::SqliteStorage;
use translate::storage::{KeyValueStorage, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cache storage: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Language(#[from] LanguageError),
    #[error("usage: jdm-translate <lang> <text>...")]
    Usage,
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter;
/// `JDM_LOG_JSON=1` switches to JSON lines.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("jdm_translate=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    let json = std::env::var("JDM_LOG_JSON").is_ok_and(|v| v == "1");
    // try_init: a subscriber may already be installed (tests, embedding apps).
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Translate `texts` into `lang` and print one line per input.
/// Earlier arguments get more urgent priorities.
pub async fn run(args: Vec<String>) -> Result<(), AppError> {
    let mut args = args.into_iter();
    let lang = args.next().ok_or(AppError::Usage)?;
    let texts: Vec<String> = args.collect();
    if texts.is_empty() {
        return Err(AppError::Usage);
    }

    let config = Config::load()?;
    info!(endpoint = %config.endpoint, cache = %config.cache_path.display(), "jdm-translate starting");

    let storage: Arc<dyn KeyValueStorage> =
        Arc::new(SqliteStorage::open(&config.cache_path, Some(config.cache_max_bytes))?);
    let cache = Arc::new(PersistentCache::new(
        Arc::clone(&storage),
        Arc::new(SystemClock),
        config.cache.clone(),
    ));
    let backend = Arc::new(HttpBackend::new(
        config.endpoint.clone(),
        config.scheduler.request_timeout,
    )?);
    let metrics = Arc::new(MetricsRegistry::new());

    let shutdown = CancellationToken::new();
    let cleanup = PersistentCache::start_cleanup_loop(
        Arc::clone(&cache),
        CLEANUP_INTERVAL,
        shutdown.clone(),
    );

    let scheduler = Scheduler::spawn(config.scheduler.clone(), cache, backend, metrics);
    let preference = LanguagePreference::load(storage).with_scheduler(scheduler.clone());
    preference.set(&lang)?;
    let lang = preference.current();

    let results = join_all(texts.iter().enumerate().map(|(i, text)| {
        let priority = DEFAULT_PRIORITY.saturating_add(i32::try_from(i).unwrap_or(i32::MAX));
        scheduler.schedule_or_fallback(text, &lang, priority)
    }))
    .await;

    for (text, translated) in texts.iter().zip(&results) {
        println!("{text}\t{translated}");
    }

    debug!(
        stats = ?scheduler.stats(),
        cache = ?scheduler.cache().stats(),
        counters = ?scheduler.metrics().counters(),
        latency = ?scheduler.metrics().summary(),
        "metrics summary"
    );

    scheduler.shutdown();
    shutdown.cancel();
    let _ = cleanup.await;
    info!("jdm-translate done");
    Ok(())
}
