use governor::{DefaultDirectRateLimiter, Quota};
use std::num::NonZeroU32;

/// Requests-per-second ceiling shared by every matcher worker.
///
/// Backed by a GCRA limiter whose state is updated atomically, so cloning an
/// `Arc<RateLimiter>` into each worker is all the sharing that is needed.
/// Independent of retry backoff: every attempt, retries included, takes a permit.
pub struct RateLimiter {
    inner: Option<DefaultDirectRateLimiter>,
    per_second: u32,
}

impl RateLimiter {
    /// `0` disables limiting.
    pub fn per_second(per_second: u32) -> Self {
        Self {
            inner: NonZeroU32::new(per_second)
                .map(|rate| governor::RateLimiter::direct(Quota::per_second(rate))),
            per_second,
        }
    }

    pub fn unlimited() -> Self {
        Self::per_second(0)
    }

    pub fn is_limited(&self) -> bool {
        self.inner.is_some()
    }

    pub fn rate(&self) -> u32 {
        self.per_second
    }

    /// Waits until a request may be sent.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("per_second", &self.per_second)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        assert!(!limiter.is_limited());
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_ceiling_shared_across_tasks() {
        let limiter = Arc::new(RateLimiter::per_second(4));
        let start = Instant::now();

        // Burst of 4 is free, the remaining 4 need ~250ms each
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(700));
    }
}
