//! Token bucket limiting how fast we call into the runtime.

use std::time::Duration;

use csi_image_common::{CsiImageError, CsiImageResult};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Token bucket with reservations.
///
/// A caller that finds the bucket empty still gets a token, but is told how
/// long to wait before using it, so callers are delayed rather than refused.
#[derive(Debug)]
pub struct RateLimiter {
    operation: &'static str,
    rate: f64,
    burst: u32,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    /// Allow `rate` operations per second with bursts of up to `burst`.
    #[must_use]
    pub fn new(operation: &'static str, rate: f64, burst: u32) -> Self {
        Self {
            operation,
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }

    /// Take a token, returning how long to wait before using it.
    ///
    /// # Errors
    ///
    /// Returns `RateLimit` if the limiter can never grant a token.
    pub fn reserve(&self) -> CsiImageResult<Duration> {
        if !(self.rate > 0.0 && self.rate.is_finite()) || self.burst == 0 {
            return Err(CsiImageError::RateLimit {
                operation: self.operation.to_string(),
            });
        }

        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let refill = now.duration_since(bucket.last).as_secs_f64() * self.rate;
        bucket.tokens = (bucket.tokens + refill).min(f64::from(self.burst));
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Ok(Duration::ZERO)
        } else {
            Ok(Duration::from_secs_f64(-bucket.tokens / self.rate))
        }
    }

    /// Take a token and sleep until it may be used.
    ///
    /// # Errors
    ///
    /// Returns `RateLimit` if the limiter can never grant a token.
    pub async fn acquire(&self) -> CsiImageResult<()> {
        let delay = self.reserve()?;
        if !delay.is_zero() {
            tracing::debug!(
                operation = self.operation,
                delay_ms = delay.as_millis(),
                "Rate limited, delaying"
            );
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
