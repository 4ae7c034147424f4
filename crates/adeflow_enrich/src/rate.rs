use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::{EnrichError, EnrichResult};

/// Shared token bucket for outbound calls.
///
/// Refills at `qps` permits per second up to `burst`. The lock is held while
/// waiting, so callers are served in arrival order and the aggregate rate
/// across every worker stays within `qps * t + burst` for any window `t`.
#[derive(Debug)]
pub struct RateBudget {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

const MIN_WAIT: Duration = Duration::from_millis(1);

impl RateBudget {
    pub fn new(qps: f64) -> EnrichResult<Self> {
        Self::with_burst(qps, 1)
    }

    pub fn with_burst(qps: f64, burst: u32) -> EnrichResult<Self> {
        if !qps.is_finite() || qps <= 0.0 {
            return Err(EnrichError::InvalidRate(qps));
        }
        let burst = f64::from(burst.max(1));
        Ok(Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn qps(&self) -> f64 {
        self.qps
    }

    /// Wait until a permit is available and take it.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
            bucket.last_refill = now;

            if bucket.tokens >= 1.0 - 1e-9 {
                bucket.tokens = (bucket.tokens - 1.0).max(0.0);
                return;
            }

            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.qps).max(MIN_WAIT);
            trace!(wait_ms = wait.as_millis() as u64, "rate budget exhausted, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}
