//! Retry with exponential backoff for source calls
//!
//! Throttled and transient source failures are retried with exponential
//! backoff and deterministic jitter; anything else is returned as is.
//!
//! # Example
//!
//! ```rust
//! use ferry_replicator::retry::RetryConfig;
//! use std::time::Duration;
//!
//! let config = RetryConfig::builder()
//!     .max_retries(5)
//!     .retry_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(5))
//!     .jitter(0.0)
//!     .build();
//!
//! assert!(config.should_retry(4));
//! assert!(!config.should_retry(5));
//! assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ReplicationError, Result};

/// Backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// `-1` = infinite, `0` = disabled, `n` = up to n retries
    max_retries: i32,
    retry_delay: Duration,
    max_delay: Duration,
    /// 0.0 - 1.0
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Create a builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// No retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Retry forever
    pub fn infinite() -> Self {
        Self {
            max_retries: -1,
            ..Default::default()
        }
    }

    /// Maximum retries (-1 = infinite, 0 = disabled)
    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    /// Base delay
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Delay cap
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Whether attempt number `attempt` (0-based) may be retried
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_retries {
            -1 => true,
            0 => false,
            n => attempt < n as u32,
        }
    }

    /// `retry_delay * 2^attempt`, capped, with jitter applied
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .retry_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = base.min(self.max_delay);

        if self.jitter > 0.0 {
            let range = capped.as_secs_f64() * self.jitter;
            // golden-ratio sequence keeps jitter reproducible
            let offset = (attempt as f64 * 0.618033988749895) % 1.0;
            let adjusted = capped.as_secs_f64() + range * (offset * 2.0 - 1.0);
            Duration::from_secs_f64(adjusted.max(0.0))
        } else {
            capped
        }
    }
}

/// Builder for [`RetryConfig`]
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    max_retries: Option<i32>,
    retry_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<f64>,
}

impl RetryConfigBuilder {
    /// Set maximum retries
    pub fn max_retries(mut self, value: i32) -> Self {
        self.max_retries = Some(value);
        self
    }

    /// Set base delay
    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.retry_delay = Some(value);
        self
    }

    /// Set delay cap
    pub fn max_delay(mut self, value: Duration) -> Self {
        self.max_delay = Some(value);
        self
    }

    /// Set jitter factor (clamped to 0.0 - 1.0)
    pub fn jitter(mut self, value: f64) -> Self {
        self.jitter = Some(value.clamp(0.0, 1.0));
        self
    }

    /// Build the config
    pub fn build(self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

/// Run `f` until it succeeds, fails permanently, exhausts the policy or is
/// cancelled.
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && config.should_retry(attempt) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    throttled = e.is_throttled(),
                    error = %e,
                    "Retrying source call"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_should_retry() {
        assert!(!RetryConfig::disabled().should_retry(0));
        assert!(RetryConfig::infinite().should_retry(u32::MAX - 1));
        let config = RetryConfig::builder().max_retries(2).build();
        assert!(config.should_retry(1));
        assert!(!config.should_retry(2));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::builder()
            .retry_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(8))
            .jitter(0.0)
            .build();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(30), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::builder()
            .retry_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(1))
            .jitter(0.5)
            .build();
        for attempt in 0..20 {
            let d = config.delay_for_attempt(attempt);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let cancel = CancellationToken::new();
        let value = retry(&RetryConfig::default(), &cancel, "scan", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(ReplicationError::throttled("ProvisionedThroughputExceeded"))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let cancel = CancellationToken::new();
        let err = retry(&RetryConfig::default(), &cancel, "scan", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ReplicationError::source("access denied"))
        })
        .await
        .unwrap_err();
        assert!(!err.is_retriable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let config = RetryConfig::builder().max_retries(2).build();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry(&config, &cancel, "get_records", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ReplicationError::source_transient("connection reset"))
        })
        .await
        .unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let config = RetryConfig::builder()
            .retry_delay(Duration::from_secs(3600))
            .max_delay(Duration::from_secs(3600))
            .build();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = retry(&config, &cancel, "scan", || async {
            Err::<(), _>(ReplicationError::throttled("slow down"))
        })
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
