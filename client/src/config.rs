//! Configuration management for the client.

use std::env;
use std::time::Duration;

/// Default recalculation throttle window.
pub const DEFAULT_THROTTLE_MS: u64 = 2000;
/// Default HTTP request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// URL the operation batches are posted to
    pub endpoint_url: String,
    /// Window within which recalculations collapse
    pub throttle: Duration,
    /// Timeout for a single round trip
    pub request_timeout: Duration,
    /// Bearer token sent with every request
    pub api_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let endpoint_url = lookup("DRAFTLINE_ENDPOINT_URL")
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingEndpointUrl)?;

        let throttle_ms = match lookup("DRAFTLINE_THROTTLE_MS") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidThrottle(raw))?,
            None => DEFAULT_THROTTLE_MS,
        };

        let timeout_secs = match lookup("DRAFTLINE_REQUEST_TIMEOUT_SECS") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidTimeout(raw))?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        let api_token = lookup("DRAFTLINE_API_TOKEN").filter(|t| !t.is_empty());

        Ok(Self {
            endpoint_url,
            throttle: Duration::from_millis(throttle_ms),
            request_timeout: Duration::from_secs(timeout_secs),
            api_token,
        })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("DRAFTLINE_ENDPOINT_URL environment variable is required")]
    MissingEndpointUrl,

    #[error("Invalid DRAFTLINE_THROTTLE_MS value: {0}")]
    InvalidThrottle(String),

    #[error("Invalid DRAFTLINE_REQUEST_TIMEOUT_SECS value: {0}")]
    InvalidTimeout(String),
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
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config =
            Config::from_lookup(lookup(&[("DRAFTLINE_ENDPOINT_URL", "http://localhost/ops")]))
                .unwrap();
        assert_eq!(config.endpoint_url, "http://localhost/ops");
        assert_eq!(config.throttle, Duration::from_millis(2000));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.api_token, None);
    }

    #[test]
    fn overrides_apply() {
        let config = Config::from_lookup(lookup(&[
            ("DRAFTLINE_ENDPOINT_URL", "http://localhost/ops"),
            ("DRAFTLINE_THROTTLE_MS", "500"),
            ("DRAFTLINE_REQUEST_TIMEOUT_SECS", "5"),
            ("DRAFTLINE_API_TOKEN", "secret"),
        ]))
        .unwrap();
        assert_eq!(config.throttle, Duration::from_millis(500));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.api_token.as_deref(), Some("secret"));
    }

    #[test]
    fn missing_url_is_an_error() {
        assert_eq!(
            Config::from_lookup(lookup(&[])),
            Err(ConfigError::MissingEndpointUrl)
        );
    }

    #[test]
    fn invalid_numbers_are_errors() {
        let result = Config::from_lookup(lookup(&[
            ("DRAFTLINE_ENDPOINT_URL", "http://localhost/ops"),
            ("DRAFTLINE_THROTTLE_MS", "soon"),
        ]));
        assert_eq!(result, Err(ConfigError::InvalidThrottle("soon".into())));
    }
}
