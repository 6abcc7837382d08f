//! Retry policy and executor for remote calls
//!
//! Every remote call goes through [`RetryExecutor::retry`]. Errors are sorted
//! into throttling, client, service and fatal classes; throttling backs off
//! over a wider range with full jitter, everything else backs off
//! exponentially up to `max_delay`.

use crate::{ClientError, Config, Result};
use cloudstore_crypto::CryptoError;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lower bound of the throttling backoff range
pub const THROTTLE_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Upper bound of the throttling backoff range
pub const THROTTLE_MAX_DELAY: Duration = Duration::from_secs(600);

/// How a failure is treated by the retry policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Service asked us to slow down
    Throttling,
    /// 4xx-class rejection
    Client,
    /// Transient service, network or stream failure
    Service,
    /// Never retried
    Fatal,
}

/// Backoff settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling for non-throttling delays
    pub max_delay: Duration,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Whether 4xx-class errors are retried
    pub retry_on_client_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RetryPolicy {
    /// Policy from client configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial_delay: config.initial_retry_delay,
            max_delay: config.max_retry_delay,
            max_retries: config.max_retries,
            retry_on_client_error: config.retry_on_client_error,
        }
    }

    /// Policy that never retries
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Classify an error
    pub fn classify(&self, error: &ClientError) -> ErrorClass {
        match error {
            ClientError::Usage(_)
            | ClientError::NotUploadedByThisTool { .. }
            | ClientError::UnsupportedVersion(_)
            | ClientError::Config(_)
            | ClientError::Batch { .. }
            | ClientError::NotFound { .. }
            | ClientError::Join(_) => ErrorClass::Fatal,

            ClientError::Crypto(CryptoError::CorruptStream(_)) => ErrorClass::Service,
            ClientError::Crypto(_) => ErrorClass::Fatal,

            ClientError::BadHash { .. }
            | ClientError::CorruptStream(_)
            | ClientError::UnexpectedEof { .. }
            | ClientError::InvalidResponse(_)
            | ClientError::InjectedFault(_)
            | ClientError::Io(_) => ErrorClass::Service,

            ClientError::S3Error { .. } | ClientError::Http(_) => {
                if error.is_throttling() {
                    ErrorClass::Throttling
                } else {
                    match error.status() {
                        Some(status) if (400..500).contains(&status) => ErrorClass::Client,
                        _ => ErrorClass::Service,
                    }
                }
            }
        }
    }

    /// Whether the `retry_count`-th retry (1-based) should happen
    pub fn should_retry(&self, error: &ClientError, retry_count: u32) -> bool {
        let retryable = match self.classify(error) {
            ErrorClass::Fatal => false,
            ErrorClass::Client => self.retry_on_client_error,
            ErrorClass::Throttling | ErrorClass::Service => true,
        };
        retryable && retry_count <= self.max_retries
    }

    /// Delay before the `retry_count`-th retry (1-based)
    pub fn delay(&self, error: &ClientError, retry_count: u32) -> Duration {
        if self.classify(error) == ErrorClass::Throttling {
            let ceiling = exp_backoff(THROTTLE_INITIAL_DELAY, THROTTLE_MAX_DELAY, retry_count);
            let millis = ceiling.as_millis() as u64;
            if millis == 0 {
                return Duration::ZERO;
            }
            return Duration::from_millis(rand::thread_rng().gen_range(0..millis));
        }
        exp_backoff(self.initial_delay, self.max_delay, retry_count)
    }
}

fn exp_backoff(initial: Duration, max: Duration, retry_count: u32) -> Duration {
    if retry_count == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(retry_count - 1);
    initial.saturating_mul(factor).min(max)
}

/// Notification sent before every retry
#[derive(Clone, Debug)]
pub struct RetryEvent {
    /// Label of the retried operation
    pub operation: String,
    /// Retry number, 1-based
    pub attempt: u32,
    /// Backoff before the retry
    pub delay: Duration,
    /// Error that triggered the retry
    pub error: String,
}

/// Callback invoked on every retry
pub type RetryHook = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Runs remote operations under a retry policy
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    on_retry: Option<RetryHook>,
}

impl RetryExecutor {
    /// Create an executor
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            on_retry: None,
        }
    }

    /// Observe retries
    pub fn with_retry_hook(mut self, hook: RetryHook) -> Self {
        self.on_retry = Some(hook);
        self
    }

    /// The policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds or the policy gives up.
    ///
    /// The backoff sleep happens on the calling task, so whatever slot the
    /// caller holds stays held while it waits. The final error is returned
    /// unchanged.
    pub async fn retry<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry_count = 0u32;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            retry_count += 1;
            if !self.policy.should_retry(&error, retry_count) {
                debug!(operation = label, retries = retry_count - 1, error = %error, "giving up");
                return Err(error);
            }

            let delay = self.policy.delay(&error, retry_count);
            warn!(
                operation = label,
                attempt = retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying"
            );
            if let Some(hook) = &self.on_retry {
                hook(&RetryEvent {
                    operation: label.to_string(),
                    attempt: retry_count,
                    delay,
                    error: error.to_string(),
                });
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
