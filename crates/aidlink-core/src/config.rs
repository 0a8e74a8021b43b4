//! Sync configuration.
//!
//! Base URL, HTTP timeout and the poll periods. Defaults match the mobile
//! client (listing detail 5s, collection 10s). Override via environment
//! variables or explicit construction for tests.

use std::time::Duration;

use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base URL of the listing/request service.
    pub api_url: Url,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    pub listing_poll_interval: Duration,
    pub request_poll_interval: Duration,
    pub verification_poll_interval: Duration,
    pub collection_poll_interval: Duration,
    /// Consecutive failures before a snapshot is flagged stale (0 disables).
    pub stale_after_failures: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: Url::parse(DEFAULT_API_URL).unwrap_or_else(|_| unreachable!("constant URL")),
            request_timeout: Duration::from_millis(4_000),
            listing_poll_interval: Duration::from_millis(5_000),
            request_poll_interval: Duration::from_millis(5_000),
            verification_poll_interval: Duration::from_millis(60_000),
            collection_poll_interval: Duration::from_millis(10_000),
            stale_after_failures: 3,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables:
    /// - `AIDLINK_API_URL` (default: `http://127.0.0.1:5000`)
    /// - `AIDLINK_TIMEOUT_MS` (default: 4000)
    /// - `AIDLINK_LISTING_POLL_MS` (default: 5000)
    /// - `AIDLINK_REQUEST_POLL_MS` (default: 5000)
    /// - `AIDLINK_VERIFICATION_POLL_MS` (default: 60000)
    /// - `AIDLINK_COLLECTION_POLL_MS` (default: 10000)
    /// - `AIDLINK_STALE_AFTER_FAILURES` (default: 3)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_url = match lookup("AIDLINK_API_URL") {
            Some(raw) => Url::parse(&raw)
                .map_err(|e| ConfigError::InvalidUrl("AIDLINK_API_URL".to_string(), e.to_string()))?,
            None => defaults.api_url,
        };

        let config = Self {
            api_url,
            request_timeout: millis(&lookup, "AIDLINK_TIMEOUT_MS", defaults.request_timeout)?,
            listing_poll_interval: millis(&lookup, "AIDLINK_LISTING_POLL_MS", defaults.listing_poll_interval)?,
            request_poll_interval: millis(&lookup, "AIDLINK_REQUEST_POLL_MS", defaults.request_poll_interval)?,
            verification_poll_interval: millis(
                &lookup,
                "AIDLINK_VERIFICATION_POLL_MS",
                defaults.verification_poll_interval,
            )?,
            collection_poll_interval: millis(
                &lookup,
                "AIDLINK_COLLECTION_POLL_MS",
                defaults.collection_poll_interval,
            )?,
            stale_after_failures: match lookup("AIDLINK_STALE_AFTER_FAILURES") {
                Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
                    var: "AIDLINK_STALE_AFTER_FAILURES".to_string(),
                    value: raw,
                })?,
                None => defaults.stale_after_failures,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Every period and the HTTP timeout must be non-zero.
    ///
    /// Call again after overriding fields by hand (CLI flags, tests).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("request_timeout", self.request_timeout),
            ("listing_poll_interval", self.listing_poll_interval),
            ("request_poll_interval", self.request_poll_interval),
            ("verification_poll_interval", self.verification_poll_interval),
            ("collection_poll_interval", self.collection_poll_interval),
        ];
        match durations.iter().find(|(_, d)| d.is_zero()) {
            Some((name, _)) => Err(ConfigError::ZeroInterval((*name).to_string())),
            None => Ok(()),
        }
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::ZeroInterval(var.to_string())),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(_) => Err(ConfigError::InvalidNumber {
            var: var.to_string(),
            value: raw,
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid URL for {0}: {1}")]
    InvalidUrl(String, String),
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: String, value: String },
    #[error("{0} must be greater than zero")]
    ZeroInterval(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.listing_poll_interval, Duration::from_millis(5_000));
        assert_eq!(config.collection_poll_interval, Duration::from_millis(10_000));
    }

    #[test]
    fn overrides_are_applied() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("AIDLINK_API_URL", "https://relief.example.org/api/"),
            ("AIDLINK_LISTING_POLL_MS", "2500"),
            ("AIDLINK_STALE_AFTER_FAILURES", "5"),
        ]))
        .unwrap();

        assert_eq!(config.api_url.as_str(), "https://relief.example.org/api/");
        assert_eq!(config.listing_poll_interval, Duration::from_millis(2_500));
        assert_eq!(config.stale_after_failures, 5);
        assert_eq!(config.request_poll_interval, Duration::from_millis(5_000));
    }

    #[test]
    fn invalid_values_fail_fast() {
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("AIDLINK_API_URL", "not a url")])),
            Err(ConfigError::InvalidUrl(..))
        ));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("AIDLINK_TIMEOUT_MS", "soon")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("AIDLINK_COLLECTION_POLL_MS", "0")])),
            Err(ConfigError::ZeroInterval(_))
        ));
    }

    #[test]
    fn validate_catches_zero_set_after_loading() {
        let mut config = SyncConfig::default();
        assert!(config.validate().is_ok());

        config.listing_poll_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval(name)) if name == "listing_poll_interval"
        ));
    }
}
