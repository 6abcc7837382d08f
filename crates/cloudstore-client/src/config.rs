//! Client configuration

use crate::{ClientError, Result};
use std::time::Duration;

/// Client configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Object store endpoint URL
    pub endpoint: String,
    /// Access token (bearer)
    pub access_token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Maximum retries per remote call
    pub max_retries: u32,
    /// Backoff before the first retry
    pub initial_retry_delay: Duration,
    /// Backoff ceiling for non-throttling errors
    pub max_retry_delay: Duration,
    /// Retry 4xx responses as well
    pub retry_on_client_error: bool,
    /// Part size; `None` picks one from the file length
    pub chunk_size: Option<u64>,
    /// Concurrent remote calls (transport pool)
    pub max_concurrent_requests: usize,
    /// Concurrent objects in directory operations (orchestration pool)
    pub max_concurrent_transfers: usize,
    /// Log intended actions without performing them
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            access_token: None,
            timeout: Duration::from_secs(60),
            user_agent: format!("cloudstore-client/{}", env!("CARGO_PKG_VERSION")),
            max_retries: 15,
            initial_retry_delay: Duration::from_millis(300),
            max_retry_delay: Duration::from_secs(20),
            retry_on_client_error: false,
            chunk_size: None,
            max_concurrent_requests: 10,
            max_concurrent_transfers: 4,
            dry_run: false,
        }
    }
}

impl Config {
    /// Create a new config with the given endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Load from `CLOUDSTORE_*` environment variables (and a `.env` file if present)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(endpoint) = std::env::var("CLOUDSTORE_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(token) = std::env::var("CLOUDSTORE_ACCESS_TOKEN") {
            config.access_token = Some(token);
        }
        if let Some(secs) = env_number("CLOUDSTORE_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_number("CLOUDSTORE_MAX_RETRIES")? {
            config.max_retries = retries as u32;
        }
        if let Some(ms) = env_number("CLOUDSTORE_INITIAL_RETRY_DELAY_MS")? {
            config.initial_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("CLOUDSTORE_MAX_RETRY_DELAY_MS")? {
            config.max_retry_delay = Duration::from_millis(ms);
        }
        if let Some(size) = env_number("CLOUDSTORE_CHUNK_SIZE")? {
            config.chunk_size = Some(size);
        }
        if let Some(n) = env_number("CLOUDSTORE_MAX_CONCURRENT_REQUESTS")? {
            config.max_concurrent_requests = n as usize;
        }
        if let Some(n) = env_number("CLOUDSTORE_MAX_CONCURRENT_TRANSFERS")? {
            config.max_concurrent_transfers = n as usize;
        }
        if let Ok(flag) = std::env::var("CLOUDSTORE_RETRY_ON_CLIENT_ERROR") {
            config.retry_on_client_error = parse_flag("CLOUDSTORE_RETRY_ON_CLIENT_ERROR", &flag)?;
        }
        if let Ok(flag) = std::env::var("CLOUDSTORE_DRY_RUN") {
            config.dry_run = parse_flag("CLOUDSTORE_DRY_RUN", &flag)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or divide by zero
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == Some(0) {
            return Err(ClientError::Config("chunk size must be positive".to_string()));
        }
        if self.max_concurrent_requests == 0 || self.max_concurrent_transfers == 0 {
            return Err(ClientError::Config(
                "concurrency limits must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the access token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set a fixed part size
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Set retry limits
    pub fn with_retries(mut self, max_retries: u32, initial: Duration, max: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_retry_delay = initial;
        self.max_retry_delay = max;
        self
    }

    /// Choose whether 4xx responses are retried
    pub fn with_retry_on_client_error(mut self, enabled: bool) -> Self {
        self.retry_on_client_error = enabled;
        self
    }

    /// Set pool sizes
    pub fn with_concurrency(mut self, requests: usize, transfers: usize) -> Self {
        self.max_concurrent_requests = requests;
        self.max_concurrent_transfers = transfers;
        self
    }

    /// Enable dry-run mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Build the base URL for API requests
    pub fn base_url(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ClientError::Config(format!("{} must be a number, got '{}'", name, value))),
        Err(_) => Ok(None),
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(ClientError::Config(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_retries, 15);
        assert_eq!(config.initial_retry_delay, Duration::from_millis(300));
        assert_eq!(config.max_retry_delay, Duration::from_secs(20));
        assert!(!config.retry_on_client_error);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders_and_validation() {
        let config = Config::new("http://store:9000/")
            .with_chunk_size(1024)
            .with_concurrency(2, 1)
            .with_dry_run(true);
        assert_eq!(config.base_url(), "http://store:9000");
        assert_eq!(config.chunk_size, Some(1024));
        assert!(config.dry_run);

        assert!(Config::default().with_chunk_size(0).validate().is_err());
        assert!(Config::default().with_concurrency(0, 1).validate().is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("X", "TRUE").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(parse_flag("X", "maybe").is_err());
    }
}
