//! Retry policy - backoff の長さを決める。
//!
//! 既定は 30 秒刻みの線形 backoff です。指数 backoff は上限で頭打ちになります。
//! どちらも retry 回数が増えて遅延が縮むことはありません。

use std::time::Duration;

/// Backoff applied before a failed task becomes eligible again.
///
/// Any policy is acceptable as long as delays never shrink as the retry
/// count grows.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// delay = step * retry_count
    Linear { step: Duration },

    /// delay = base_delay * multiplier^(retry_count - 1), capped at max_delay
    Exponential {
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    },
}

impl RetryPolicy {
    /// Reference policy: `retry_count × 30s`.
    pub fn linear_default() -> Self {
        Self::Linear {
            step: Duration::from_secs(30),
        }
    }

    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self::Exponential {
            base_delay,
            multiplier: multiplier.max(1.0),
            max_delay,
        }
    }

    /// Delay before the next attempt.
    ///
    /// `retry_count` is the count *after* the failure being handled
    /// (1 for the first failure).
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        match self {
            RetryPolicy::Linear { step } => step.saturating_mul(retry_count),
            RetryPolicy::Exponential {
                base_delay,
                multiplier,
                max_delay,
            } => {
                let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = base_delay.as_secs_f64() * multiplier.powi(exponent);
                if secs.is_nan() || secs >= max_delay.as_secs_f64() {
                    return *max_delay;
                }
                Duration::from_secs_f64(secs)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_backoff_is_retry_count_times_step() {
        let policy = RetryPolicy::linear_default();
        assert_eq!(policy.next_delay(1), Duration::from_secs(30));
        assert_eq!(policy.next_delay(2), Duration::from_secs(60));
        assert_eq!(policy.next_delay(3), Duration::from_secs(90));
    }

    #[test]
    fn exponential_backoff_increases_until_cap() {
        let policy =
            RetryPolicy::exponential(Duration::from_secs(2), 2.0, Duration::from_secs(10));

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn policies_are_monotonic() {
        for policy in [
            RetryPolicy::linear_default(),
            RetryPolicy::exponential(Duration::from_millis(500), 3.0, Duration::from_secs(600)),
        ] {
            let delays: Vec<_> = (1..=10).map(|n| policy.next_delay(n)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{policy:?}");
        }
    }
}
