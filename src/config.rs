use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::scheduler::SchedulerConfig;
use crate::translate::cache::CacheConfig;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:3000/api/translate";
pub const DEFAULT_CACHE_PATH: &str = "jdm-translation-cache.db";
/// Typical browser local-storage quota.
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    pub cache_path: PathBuf,
    pub cache_max_bytes: u64,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source; `load` passes the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let scheduler_defaults = SchedulerConfig::default();
        let cache_defaults = CacheConfig::default();

        let scheduler = SchedulerConfig {
            max_concurrent_requests: try_load(
                &lookup,
                "JDM_MAX_CONCURRENT",
                scheduler_defaults.max_concurrent_requests,
            )?,
            request_interval: Duration::from_millis(try_load(
                &lookup,
                "JDM_REQUEST_INTERVAL_MS",
                millis(scheduler_defaults.request_interval),
            )?),
            max_retries: try_load(&lookup, "JDM_MAX_RETRIES", scheduler_defaults.max_retries)?,
            request_timeout: Duration::from_millis(try_load(
                &lookup,
                "JDM_REQUEST_TIMEOUT_MS",
                millis(scheduler_defaults.request_timeout),
            )?),
            ..scheduler_defaults
        };
        if scheduler.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid {
                key: "JDM_MAX_CONCURRENT",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let cache = CacheConfig {
            expiry_ms: try_load(&lookup, "JDM_CACHE_TTL_MS", cache_defaults.expiry_ms)?,
            ..cache_defaults
        };

        Ok(Self {
            endpoint: try_load(&lookup, "JDM_TRANSLATE_ENDPOINT", DEFAULT_ENDPOINT.to_string())?,
            cache_path: PathBuf::from(try_load::<String>(
                &lookup,
                "JDM_CACHE_PATH",
                DEFAULT_CACHE_PATH.to_string(),
            )?),
            cache_max_bytes: try_load(&lookup, "JDM_CACHE_MAX_BYTES", DEFAULT_CACHE_MAX_BYTES)?,
            cache,
            scheduler,
        })
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn try_load<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            ConfigError::Invalid {
                key,
                value: raw,
                reason: e.to_string(),
            }
        }),
    }
}
