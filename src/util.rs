//! Small shared helpers

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Current wall-clock time as nanoseconds since the Unix epoch
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Routing time bucket for a timestamp: `floor(ts / bucket)`
pub fn time_bucket(ts_ns: i64, bucket: Duration) -> i64 {
    let bucket_ns = bucket.as_nanos() as i64;
    if bucket_ns <= 0 {
        return 0;
    }
    ts_ns.div_euclid(bucket_ns)
}

/// Full-jitter backoff delay for `attempt` (0-based): uniform in
/// [0, min(cap, base·2^attempt)].
pub fn full_jitter_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let ceiling = base
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(cap);
    if ceiling.is_zero() {
        return Duration::ZERO;
    }
    let nanos = rand::thread_rng().gen_range(0..=ceiling.as_nanos() as u64);
    Duration::from_nanos(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_bucket_boundaries() {
        let bucket = Duration::from_secs(300);
        let ns = 300 * 1_000_000_000i64;
        assert_eq!(time_bucket(0, bucket), 0);
        assert_eq!(time_bucket(ns - 1, bucket), 0);
        assert_eq!(time_bucket(ns, bucket), 1);
        assert_eq!(time_bucket(3 * ns + 5, bucket), 3);
    }

    #[test]
    fn test_full_jitter_bounded() {
        for attempt in 0..10 {
            let d = full_jitter_delay(
                Duration::from_secs(10),
                Duration::from_secs(600),
                attempt,
            );
            assert!(d <= Duration::from_secs(600));
        }
    }

    #[test]
    fn test_now_ns_is_recent() {
        // After 2023 and monotone-ish
        let a = now_ns();
        assert!(a > 1_672_531_200_000_000_000);
        assert!(now_ns() >= a);
    }
}
