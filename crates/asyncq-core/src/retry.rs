use std::time::Duration;

use rand::Rng;

/// Delay before a failed task is attempted again, unless a policy or the
/// handler says otherwise.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(180);

/// How long to wait before re-publishing a failed task.
///
/// `Fixed` mirrors Celery's `default_retry_delay`. `ExponentialJitter`
/// doubles a base per attempt, caps the result, then spreads it +/-20% so
/// tasks that failed together do not reconverge on the broker together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryPolicy {
    Fixed { delay: Duration },
    ExponentialJitter { base: Duration, cap: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed {
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy with a 5s base capped at one hour.
    pub fn exponential() -> Self {
        RetryPolicy::ExponentialJitter {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(3600),
        }
    }

    /// Delay before the next attempt, given how many attempts have already
    /// been made.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Fixed { delay } => *delay,
            RetryPolicy::ExponentialJitter { base, cap } => {
                let exponent = attempt.min(20);
                let raw = base.saturating_mul(2u32.saturating_pow(exponent));
                let capped = raw.min(*cap);
                capped.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_policy_is_constant() {
        let policy = RetryPolicy::Fixed {
            delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for(7), Duration::from_secs(30));
    }

    #[test]
    fn test_default_matches_celery_delay() {
        assert_eq!(
            RetryPolicy::default().delay_for(2),
            Duration::from_secs(180)
        );
    }

    #[test]
    fn test_exponential_growth_within_jitter_bounds() {
        let policy = RetryPolicy::exponential();

        let first = policy.delay_for(0);
        assert!(first >= Duration::from_secs(4), "{first:?}");
        assert!(first <= Duration::from_secs(6), "{first:?}");

        let third = policy.delay_for(2);
        assert!(third >= Duration::from_secs(16), "{third:?}");
        assert!(third <= Duration::from_secs(24), "{third:?}");
    }

    #[test]
    fn test_exponential_caps_out() {
        let policy = RetryPolicy::exponential();
        // 5s * 2^30 would overflow the cap many times over.
        let late = policy.delay_for(30);
        assert!(late <= Duration::from_secs(3600).mul_f64(1.2), "{late:?}");
        assert!(late >= Duration::from_secs(3600).mul_f64(0.8), "{late:?}");
    }
}
