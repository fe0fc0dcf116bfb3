//! Retry policies for step execution.

use std::time::Duration;

/// How often, and with which delays, a failed step is attempted again.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// No retry - fail immediately on error.
    #[default]
    None,
    /// Fixed delay between retries.
    Fixed {
        /// Maximum number of retry attempts.
        max_retries: u32,
        /// Delay between each retry.
        delay: Duration,
    },
    /// Exponential backoff with configurable parameters.
    ExponentialBackoff {
        /// Maximum number of retry attempts.
        max_retries: u32,
        /// Initial delay before first retry.
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
        /// Multiplier for each retry.
        multiplier: u32,
    },
}

/// Error returned when [`RetryPolicy`] configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyError(pub &'static str);

impl std::fmt::Display for RetryPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryPolicyError {}

impl RetryPolicy {
    /// Retries immediately, without any delay, up to `max_retries` times.
    pub fn immediate(max_retries: u32) -> Self {
        if max_retries == 0 {
            return RetryPolicy::None;
        }
        RetryPolicy::Fixed {
            max_retries,
            delay: Duration::ZERO,
        }
    }

    /// Creates a fixed retry policy.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        RetryPolicy::Fixed { max_retries, delay }
    }

    /// Creates an exponential backoff policy doubling up to 60 seconds.
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }

    /// Creates an exponential backoff retry policy with custom settings.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError`] if `multiplier` is 0 or above 10, or if
    /// `max_delay` is less than `initial_delay`.
    pub fn exponential_backoff(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Result<Self, RetryPolicyError> {
        if multiplier == 0 {
            return Err(RetryPolicyError("multiplier must be greater than 0"));
        }
        if multiplier > 10 {
            return Err(RetryPolicyError(
                "multiplier must be 10 or less to avoid overflow",
            ));
        }
        if max_delay < initial_delay {
            return Err(RetryPolicyError("max_delay must be >= initial_delay"));
        }
        Ok(RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
        })
    }

    /// Returns the maximum number of retries for this policy.
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Fixed { max_retries, .. } => *max_retries,
            RetryPolicy::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }

    /// Total number of attempts, the first execution included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries().saturating_add(1)
    }

    /// Delay to wait before the given retry. Retries are 0-indexed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::Fixed { delay, .. } => Some(*delay),
            RetryPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let factor = (*multiplier as u64).saturating_pow(attempt);
                let delay = (initial_delay.as_millis() as u64).saturating_mul(factor);
                Some(Duration::from_millis(
                    delay.min(max_delay.as_millis() as u64),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_none() {
        let policy = RetryPolicy::None;
        assert_eq!(policy.max_retries(), 0);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.delay_for_attempt(0), None);
    }

    #[test]
    fn test_immediate_policy() {
        assert_eq!(RetryPolicy::immediate(0), RetryPolicy::None);
        let policy = RetryPolicy::immediate(2);
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_policy_exponential_is_capped() {
        let policy = RetryPolicy::ExponentialBackoff {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
        };
        assert_eq!(
            policy.delay_for_attempt(2),
            Some(Duration::from_millis(400))
        );
        assert_eq!(policy.delay_for_attempt(10), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_for_attempt(200), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_retry_policy_validation() {
        let result = RetryPolicy::exponential_backoff(
            3,
            Duration::from_millis(100),
            Duration::from_secs(10),
            0,
        );
        assert_eq!(
            result.unwrap_err().0,
            "multiplier must be greater than 0"
        );

        let result = RetryPolicy::exponential_backoff(
            3,
            Duration::from_secs(10),
            Duration::from_millis(100),
            2,
        );
        assert_eq!(result.unwrap_err().0, "max_delay must be >= initial_delay");
    }
}
