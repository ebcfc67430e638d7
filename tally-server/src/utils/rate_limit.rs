use parking_lot::Mutex;
use tokio::time::Instant;

/// A token bucket limiting how often malformed lines are logged.
///
/// The bucket holds up to one minute worth of tokens and refills continuously. A limit of `0`
/// disables logging entirely. Counting of bad lines is not affected by this limiter.
#[derive(Debug)]
pub struct BadLineLimiter {
    bucket: Option<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

impl BadLineLimiter {
    /// Creates a limiter that allows `per_minute` log lines per minute.
    pub fn new(per_minute: u32) -> Self {
        let bucket = (per_minute > 0).then(|| {
            let capacity = f64::from(per_minute);
            Mutex::new(Bucket {
                tokens: capacity,
                capacity,
                refill_per_sec: capacity / 60.0,
                last_refill: Instant::now(),
            })
        });

        Self { bucket }
    }

    /// Returns `true` if a bad line may be logged now.
    pub fn check(&self) -> bool {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> bool {
        let Some(ref bucket) = self.bucket else {
            return false;
        };

        let mut bucket = bucket.lock();
        bucket.refill(now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_disabled() {
        let limiter = BadLineLimiter::new(0);
        assert!(!limiter.check());
    }

    #[test]
    fn test_burst_and_refill() {
        let limiter = BadLineLimiter::new(2);
        let start = Instant::now();

        assert!(limiter.check_at(start));
        assert!(limiter.check_at(start));
        assert!(!limiter.check_at(start));

        // Two per minute means one token every 30 seconds.
        assert!(!limiter.check_at(start + Duration::from_secs(20)));
        assert!(limiter.check_at(start + Duration::from_secs(31)));
        assert!(!limiter.check_at(start + Duration::from_secs(32)));
    }
}
