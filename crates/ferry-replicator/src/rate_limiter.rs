//! Read-capacity limiting for table scans
//!
//! All scan segments of one table share a single bucket denominated in read
//! units. A page is charged the full number of units the previous page of its
//! segment consumed, even when that exceeds the bucket size: the balance goes
//! negative and the caller sleeps until the refill has paid the debt back.
//! Later callers see the debt too, so the long-term read rate converges on
//! the configured units per second regardless of page size.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Configuration for read-unit limiting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum read units per second (0 = unlimited)
    pub units_per_second: u64,
    /// Units a fresh or idle bucket may hand out above the steady rate.
    /// Default: 10% of units_per_second, at least 1
    pub burst_capacity: u64,
}

impl RateLimitConfig {
    /// Create a config with the default burst capacity
    pub fn new(units_per_second: u64) -> Self {
        let burst = if units_per_second == 0 {
            0
        } else {
            (units_per_second / 10).max(1)
        };
        Self {
            units_per_second,
            burst_capacity: burst,
        }
    }

    /// No throttling
    pub fn unlimited() -> Self {
        Self {
            units_per_second: 0,
            burst_capacity: 0,
        }
    }

    /// Check if limiting is enabled
    pub fn is_enabled(&self) -> bool {
        self.units_per_second > 0
    }

    /// Largest positive balance the bucket accumulates
    fn capacity(&self) -> f64 {
        (self.units_per_second + self.burst_capacity) as f64
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[derive(Debug)]
struct Bucket {
    /// Available units; negative while a large page is being paid off
    balance: f64,
    refilled_at: Instant,
}

/// Read-unit budget shared by the segments of a scan
pub struct ReadCapacityLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
    units_charged: AtomicU64,
    units_throttled: AtomicU64,
    total_wait_ns: AtomicU64,
}

impl ReadCapacityLimiter {
    /// Create a full bucket
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                balance: config.capacity(),
                refilled_at: Instant::now(),
            }),
            config,
            units_charged: AtomicU64::new(0),
            units_throttled: AtomicU64::new(0),
            total_wait_ns: AtomicU64::new(0),
        }
    }

    /// Charge `units` against the budget and wait until the balance is no
    /// longer negative. Returns the time spent waiting.
    pub async fn acquire(&self, units: u64) -> Duration {
        if !self.config.is_enabled() {
            return Duration::ZERO;
        }
        self.units_charged.fetch_add(units, Ordering::Relaxed);

        let wait = {
            let mut bucket = self.bucket.lock();
            let now = Instant::now();
            let rate = self.config.units_per_second as f64;
            let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
            bucket.balance = (bucket.balance + elapsed * rate).min(self.config.capacity());
            bucket.refilled_at = now;
            bucket.balance -= units as f64;
            if bucket.balance < 0.0 {
                Duration::from_secs_f64(-bucket.balance / rate)
            } else {
                Duration::ZERO
            }
        };

        if !wait.is_zero() {
            self.units_throttled.fetch_add(units, Ordering::Relaxed);
            self.total_wait_ns
                .fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
            debug!(units, wait_ms = wait.as_millis() as u64, "Waiting for read capacity");
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Limiter statistics
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            units_charged: self.units_charged.load(Ordering::Relaxed),
            units_throttled: self.units_throttled.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ns.load(Ordering::Relaxed) / 1_000_000,
            rate_limit: self.config.units_per_second,
            enabled: self.config.is_enabled(),
        }
    }
}

impl std::fmt::Debug for ReadCapacityLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stats())
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Units charged by all pages
    pub units_charged: u64,
    /// Units whose charge had to wait for the refill
    pub units_throttled: u64,
    /// Total time spent waiting in milliseconds
    pub total_wait_ms: u64,
    /// Configured units per second
    pub rate_limit: u64,
    /// Whether limiting is enabled
    pub enabled: bool,
}

impl std::fmt::Display for RateLimiterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.enabled {
            write!(
                f,
                "ReadCapacity({}u/s, {} charged, {} throttled, {}ms waited)",
                self.rate_limit, self.units_charged, self.units_throttled, self.total_wait_ms
            )
        } else {
            write!(f, "ReadCapacity(unlimited)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(units_per_second: u64) -> RateLimitConfig {
        RateLimitConfig {
            units_per_second,
            burst_capacity: 0,
        }
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = ReadCapacityLimiter::new(RateLimitConfig::unlimited());
        for _ in 0..1000 {
            assert_eq!(limiter.acquire(100).await, Duration::ZERO);
        }
        let stats = limiter.stats();
        assert!(!stats.enabled);
        assert_eq!(stats.to_string(), "ReadCapacity(unlimited)");
    }

    #[test]
    fn test_config_burst() {
        assert_eq!(RateLimitConfig::new(25).burst_capacity, 2);
        assert_eq!(RateLimitConfig::new(5).burst_capacity, 1);
        assert_eq!(RateLimitConfig::new(0).burst_capacity, 0);
        assert!(!RateLimitConfig::new(0).is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = ReadCapacityLimiter::new(exact(10));
        assert_eq!(limiter.acquire(10).await, Duration::ZERO);

        let waited = limiter.acquire(5).await;
        assert!(waited >= Duration::from_millis(490), "waited {:?}", waited);
        assert_eq!(limiter.stats().units_throttled, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pages_larger_than_bucket_are_charged_in_full() {
        let limiter = ReadCapacityLimiter::new(RateLimitConfig::new(10));
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire(100).await;
        }
        // 1000 units at 10/s, minus the 11 units the full bucket started with
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(98), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(100), "elapsed {:?}", elapsed);
        assert_eq!(limiter.stats().units_charged, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_segments_share_the_debt() {
        let limiter = std::sync::Arc::new(ReadCapacityLimiter::new(exact(20)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    limiter.acquire(50).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 1000 units at 20/s after a 20 unit head start
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(48), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(50), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_run_rate() {
        let limiter = ReadCapacityLimiter::new(exact(20));
        let start = Instant::now();
        // 20 initial units plus 100 more at 20/s
        for _ in 0..120 {
            limiter.acquire(1).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(6), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_bucket_caps_at_capacity() {
        let limiter = ReadCapacityLimiter::new(exact(10));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(limiter.acquire(10).await, Duration::ZERO);
        assert!(limiter.acquire(10).await >= Duration::from_millis(990));
    }
}
