use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::engine::{EngineSettings, LockRetries, RebuildStrategy};
use crate::lease::LeaseSettings;
use crate::notifier::GrafanaTarget;
use crate::selection::SelectionThresholds;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    /// When false, `run_once` logs and returns without touching the database.
    pub enabled: bool,
    pub schemas: Vec<String>,
    pub recent_window_days: u32,
    pub lease: LeaseSettings,
    pub engine: EngineSettings,
    pub default_strategy: RebuildStrategy,
    pub max_indexes_per_run: usize,
    pub queue_batch_size: usize,
    pub thresholds: SelectionThresholds,
    pub grafana: Option<GrafanaTarget>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            enabled: true,
            schemas: vec!["public".to_string()],
            recent_window_days: 10,
            lease: LeaseSettings::default(),
            engine: EngineSettings::default(),
            default_strategy: RebuildStrategy::NativeConcurrent,
            max_indexes_per_run: 1,
            queue_batch_size: 1,
            thresholds: SelectionThresholds::default(),
            grafana: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid REINDEX_ENABLED: {0}")]
    InvalidEnabled(String),
    #[error("invalid REINDEX_SCHEMAS: {0}")]
    InvalidSchemas(String),
    #[error("invalid REINDEX_RECENT_WINDOW_DAYS: {0}")]
    InvalidRecentWindowDays(String),
    #[error("invalid REINDEX_DEFAULT_STRATEGY: {0}")]
    InvalidDefaultStrategy(String),
    #[error("invalid REINDEX_STATEMENT_TIMEOUT_SECONDS: {0}")]
    InvalidStatementTimeout(String),
    #[error("invalid lease setting: {0}")]
    InvalidLeaseSetting(String),
    #[error("invalid lock retry setting: {0}")]
    InvalidLockRetrySetting(String),
    #[error("invalid run limit: {0}")]
    InvalidRunLimit(String),
    #[error("invalid selection threshold: {0}")]
    InvalidSelectionThreshold(String),
    #[error("invalid grafana config: {0}")]
    InvalidGrafanaConfig(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = non_empty(&lookup, "REINDEX_DATABASE_URL");
        let enabled = match non_empty(&lookup, "REINDEX_ENABLED") {
            Some(raw) => parse_bool(&raw).map_err(ConfigError::InvalidEnabled)?,
            None => defaults.enabled,
        };

        let schemas = match non_empty(&lookup, "REINDEX_SCHEMAS") {
            Some(raw) => {
                let schemas: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|schema| !schema.is_empty())
                    .map(str::to_string)
                    .collect();
                if schemas.is_empty() {
                    return Err(ConfigError::InvalidSchemas(
                        "at least one schema is required".to_string(),
                    ));
                }
                schemas
            }
            None => defaults.schemas,
        };

        let recent_window_days = parse_number(&lookup, "REINDEX_RECENT_WINDOW_DAYS", defaults.recent_window_days)
            .map_err(ConfigError::InvalidRecentWindowDays)?;

        let default_strategy = match non_empty(&lookup, "REINDEX_DEFAULT_STRATEGY") {
            Some(raw) => RebuildStrategy::parse(&raw).ok_or_else(|| {
                ConfigError::InvalidDefaultStrategy(format!(
                    "expected native or shadow_swap, got {raw}"
                ))
            })?,
            None => defaults.default_strategy,
        };

        let statement_timeout = Duration::from_secs(
            parse_number(
                &lookup,
                "REINDEX_STATEMENT_TIMEOUT_SECONDS",
                defaults.engine.statement_timeout.as_secs(),
            )
            .map_err(ConfigError::InvalidStatementTimeout)?,
        );

        let lease_setting = |key: &str, default: u64| {
            parse_number(&lookup, key, default).map_err(ConfigError::InvalidLeaseSetting)
        };
        let lease = LeaseSettings {
            ttl: Duration::from_secs(lease_setting(
                "REINDEX_LEASE_TIMEOUT_SECONDS",
                defaults.lease.ttl.as_secs(),
            )?),
            wait: Duration::from_secs(lease_setting(
                "REINDEX_LEASE_WAIT_SECONDS",
                defaults.lease.wait.as_secs(),
            )?),
            poll_interval: Duration::from_millis(lease_setting(
                "REINDEX_LEASE_POLL_MS",
                u64::try_from(defaults.lease.poll_interval.as_millis()).unwrap_or(1_000),
            )?),
        };
        if lease.ttl.is_zero() {
            return Err(ConfigError::InvalidLeaseSetting(
                "REINDEX_LEASE_TIMEOUT_SECONDS: must be positive".to_string(),
            ));
        }
        if !lease.wait.is_zero() && lease.poll_interval.is_zero() {
            return Err(ConfigError::InvalidLeaseSetting(
                "REINDEX_LEASE_POLL_MS: must be positive when REINDEX_LEASE_WAIT_SECONDS is set"
                    .to_string(),
            ));
        }

        let retry_setting = |key: &str, default: u64| {
            parse_number(&lookup, key, default).map_err(ConfigError::InvalidLockRetrySetting)
        };
        let swap_retries = lock_retries(
            "REINDEX_SWAP_ATTEMPTS",
            retry_setting("REINDEX_SWAP_ATTEMPTS", 10)?,
            Duration::from_millis(retry_setting("REINDEX_SWAP_LOCK_TIMEOUT_MS", 1_000)?),
            Duration::from_millis(retry_setting("REINDEX_SWAP_SLEEP_MS", 1_000)?),
        )?;
        let cleanup_retries = lock_retries(
            "REINDEX_CLEANUP_ATTEMPTS",
            retry_setting("REINDEX_CLEANUP_ATTEMPTS", 30)?,
            Duration::from_secs(retry_setting("REINDEX_CLEANUP_LOCK_TIMEOUT_SECONDS", 60)?),
            Duration::from_secs(retry_setting("REINDEX_CLEANUP_SLEEP_SECONDS", 540)?),
        )?;

        let run_limit = |key: &str, default: usize| -> Result<usize, ConfigError> {
            let value = parse_number(&lookup, key, default).map_err(ConfigError::InvalidRunLimit)?;
            if value == 0 {
                return Err(ConfigError::InvalidRunLimit(format!("{key}: must be positive")));
            }
            Ok(value)
        };
        let max_indexes_per_run =
            run_limit("REINDEX_MAX_INDEXES_PER_RUN", defaults.max_indexes_per_run)?;
        let queue_batch_size = run_limit("REINDEX_QUEUE_BATCH_SIZE", defaults.queue_batch_size)?;

        let thresholds = parse_thresholds(&lookup, &defaults.thresholds)?;
        let grafana = parse_grafana(&lookup)?;

        Ok(Self {
            database_url,
            enabled,
            schemas,
            recent_window_days,
            lease,
            engine: EngineSettings {
                statement_timeout,
                swap_retries,
                cleanup_retries,
            },
            default_strategy,
            max_indexes_per_run,
            queue_batch_size,
            thresholds,
            grafana,
        })
    }

    pub fn recent_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.recent_window_days))
    }
}

fn lock_retries(
    attempts_key: &str,
    attempts: u64,
    lock_timeout: Duration,
    sleep: Duration,
) -> Result<LockRetries, ConfigError> {
    let attempts = u32::try_from(attempts)
        .ok()
        .filter(|attempts| *attempts > 0)
        .ok_or_else(|| {
            ConfigError::InvalidLockRetrySetting(format!(
                "{attempts_key}: must be between 1 and {}",
                u32::MAX
            ))
        })?;
    Ok(LockRetries::uniform(attempts, lock_timeout, sleep))
}

fn parse_thresholds(
    lookup: &impl Fn(&str) -> Option<String>,
    defaults: &SelectionThresholds,
) -> Result<SelectionThresholds, ConfigError> {
    let min_ondisk_size_bytes = parse_number(
        lookup,
        "REINDEX_MIN_INDEX_SIZE_BYTES",
        defaults.min_ondisk_size_bytes,
    )
    .map_err(ConfigError::InvalidSelectionThreshold)?;
    // Zero disables the upper bound.
    let max_ondisk_size_bytes = parse_number(
        lookup,
        "REINDEX_MAX_INDEX_SIZE_BYTES",
        defaults.max_ondisk_size_bytes.unwrap_or(100 * GIB),
    )
    .map_err(ConfigError::InvalidSelectionThreshold)?;
    let max_ondisk_size_bytes = (max_ondisk_size_bytes > 0).then_some(max_ondisk_size_bytes);
    if let Some(max) = max_ondisk_size_bytes
        && max < min_ondisk_size_bytes
    {
        return Err(ConfigError::InvalidSelectionThreshold(format!(
            "REINDEX_MAX_INDEX_SIZE_BYTES ({max}) is below REINDEX_MIN_INDEX_SIZE_BYTES ({min_ondisk_size_bytes})"
        )));
    }

    let min_relative_bloat = parse_number(
        lookup,
        "REINDEX_MIN_RELATIVE_BLOAT",
        defaults.min_relative_bloat,
    )
    .map_err(ConfigError::InvalidSelectionThreshold)?;
    if !(0.0..=1.0).contains(&min_relative_bloat) {
        return Err(ConfigError::InvalidSelectionThreshold(format!(
            "REINDEX_MIN_RELATIVE_BLOAT: {min_relative_bloat} is outside 0..=1"
        )));
    }

    let min_absolute_bloat_bytes = parse_number(
        lookup,
        "REINDEX_MIN_ABSOLUTE_BLOAT_BYTES",
        defaults.min_absolute_bloat_bytes,
    )
    .map_err(ConfigError::InvalidSelectionThreshold)?;

    Ok(SelectionThresholds {
        min_ondisk_size_bytes,
        max_ondisk_size_bytes,
        min_relative_bloat,
        min_absolute_bloat_bytes,
    })
}

fn parse_grafana(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<GrafanaTarget>, ConfigError> {
    let api_url = non_empty(lookup, "REINDEX_GRAFANA_API_URL");
    let api_key = non_empty(lookup, "REINDEX_GRAFANA_API_KEY");
    let (api_url, api_key) = match (api_url, api_key) {
        (None, None) => return Ok(None),
        (Some(api_url), Some(api_key)) => (api_url, api_key),
        (Some(_), None) => {
            return Err(ConfigError::InvalidGrafanaConfig(
                "REINDEX_GRAFANA_API_KEY is required when REINDEX_GRAFANA_API_URL is set"
                    .to_string(),
            ));
        }
        (None, Some(_)) => {
            return Err(ConfigError::InvalidGrafanaConfig(
                "REINDEX_GRAFANA_API_URL is required when REINDEX_GRAFANA_API_KEY is set"
                    .to_string(),
            ));
        }
    };
    if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
        return Err(ConfigError::InvalidGrafanaConfig(format!(
            "REINDEX_GRAFANA_API_URL must be an http(s) url, got {api_url}"
        )));
    }
    let timeout_ms = parse_number(lookup, "REINDEX_GRAFANA_TIMEOUT_MS", 5_000_u64)
        .map_err(ConfigError::InvalidGrafanaConfig)?;

    Ok(Some(GrafanaTarget {
        api_url,
        api_key,
        additional_tag: non_empty(lookup, "REINDEX_GRAFANA_ADDITIONAL_TAG"),
        timeout: Duration::from_millis(timeout_ms),
    }))
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_number<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, key) {
        Some(raw) => raw.parse::<T>().map_err(|error| format!("{key}: {error}")),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected boolean, got {other}")),
    }
}
