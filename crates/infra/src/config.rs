//! Environment-driven configuration for the job layer.

use std::time::Duration;

use crate::jobs::{
    DEFAULT_RESULT_TTL, DispatcherConfig, InMemoryResultStore, JobEnvelope, KeySpace,
};

pub const RESULT_TTL_VAR: &str = "OPTFORGE_RESULT_TTL_SECS";
pub const STATUS_TTL_VAR: &str = "OPTFORGE_STATUS_TTL_SECS";
pub const KEY_PREFIX_VAR: &str = "OPTFORGE_KEY_PREFIX";
pub const POLL_INTERVAL_VAR: &str = "OPTFORGE_POLL_INTERVAL_MS";
pub const REDIS_URL_VAR: &str = "REDIS_URL";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsConfig {
    pub result_ttl: Duration,
    /// `None` keeps status records until overwritten
    pub status_ttl: Option<Duration>,
    pub key_prefix: Option<String>,
    pub redis_url: Option<String>,
    pub poll_interval: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            result_ttl: DEFAULT_RESULT_TTL,
            status_ttl: None,
            key_prefix: None,
            redis_url: None,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl JobsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let result_ttl = match get(RESULT_TTL_VAR) {
            Some(v) => Duration::from_secs(parse_positive(RESULT_TTL_VAR, &v)?),
            None => defaults.result_ttl,
        };
        let status_ttl = get(STATUS_TTL_VAR)
            .map(|v| parse_positive(STATUS_TTL_VAR, &v).map(Duration::from_secs))
            .transpose()?;
        let poll_interval = match get(POLL_INTERVAL_VAR) {
            Some(v) => Duration::from_millis(parse_positive(POLL_INTERVAL_VAR, &v)?),
            None => defaults.poll_interval,
        };

        Ok(Self {
            result_ttl,
            status_ttl,
            key_prefix: get(KEY_PREFIX_VAR),
            redis_url: get(REDIS_URL_VAR),
            poll_interval,
        })
    }

    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.key_prefix.clone())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default().with_poll_interval(self.poll_interval)
    }

    pub fn in_memory_store(&self) -> InMemoryResultStore {
        InMemoryResultStore::new()
            .with_key_space(self.key_space())
            .with_status_ttl(self.status_ttl)
    }

    /// Envelope over the in-memory store with the configured result TTL.
    pub fn in_memory_envelope(&self) -> JobEnvelope<InMemoryResultStore> {
        JobEnvelope::new(self.in_memory_store()).with_result_ttl(self.result_ttl)
    }

    /// Redis store from `REDIS_URL`, or `None` when it is unset.
    #[cfg(feature = "redis")]
    pub fn redis_store(
        &self,
    ) -> Option<Result<crate::jobs::RedisResultStore, crate::jobs::ResultStoreError>> {
        self.redis_url.as_ref().map(|url| {
            crate::jobs::RedisResultStore::new(url).map(|store| {
                store
                    .with_key_space(self.key_space())
                    .with_status_ttl(self.status_ttl)
            })
        })
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}
