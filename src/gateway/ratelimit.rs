//! Advisory per-connection ratelimit buckets for gateway ops.
//!
//! Counters decay on a fixed window. `presence_updates` silently drops the
//! op when exhausted; `identify` and `all` close the socket.

use tokio::time::{Duration, Instant};

#[derive(Debug)]
pub struct Bucket {
    limit: u32,
    window: Duration,
    remaining: u32,
    reset_at: Instant,
}

impl Bucket {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            remaining: limit,
            reset_at: Instant::now() + window,
        }
    }

    /// Take one token. False means the bucket is exhausted for this window.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> bool {
        if now >= self.reset_at {
            self.remaining = self.limit;
            self.reset_at = now + self.window;
        }
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// The bucket set every connection carries.
#[derive(Debug)]
pub struct WsRateLimits {
    pub identify: Bucket,
    pub presence_updates: Bucket,
    pub all: Bucket,
}

impl Default for WsRateLimits {
    fn default() -> Self {
        Self {
            identify: Bucket::new(1, Duration::from_secs(5)),
            presence_updates: Bucket::new(5, Duration::from_secs(10)),
            all: Bucket::new(120, Duration::from_secs(60)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_exhausts_then_replenishes() {
        let start = Instant::now();
        let mut bucket = Bucket::new(2, Duration::from_secs(10));
        assert!(bucket.check_at(start));
        assert!(bucket.check_at(start));
        assert!(!bucket.check_at(start));
        // window passes
        assert!(bucket.check_at(start + Duration::from_secs(10)));
    }

    #[test]
    fn identify_bucket_allows_one_attempt() {
        let mut limits = WsRateLimits::default();
        assert!(limits.identify.check());
        assert!(!limits.identify.check());
    }
}
