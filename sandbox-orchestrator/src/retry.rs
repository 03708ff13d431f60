use rand::Rng;
use sandbox_clients::ClientError;
use std::fmt;
use std::time::Duration;

/// Bounded exponential backoff shared by every downstream call, forward and
/// compensating alike.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// `max_attempts` attempts with no delay between them.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO).with_jitter(false)
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32, error: &ClientError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Delay before the attempt following attempt number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let backoff = self.base_delay.as_secs_f64() * 2_f64.powi(exponent);
        let capped = backoff.min(self.max_delay.as_secs_f64());

        if self.jitter && capped > 0.0 {
            let factor = rand::rng().random_range(0.75..=1.0);
            Duration::from_secs_f64(capped * factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Why a step gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum StepFailure {
    /// The service rejected the call; retrying cannot help.
    Permanent(ClientError),
    /// Every attempt failed transiently.
    ExhaustedRetries { attempts: u32, last: ClientError },
}

impl StepFailure {
    pub fn last_error(&self) -> &ClientError {
        match self {
            StepFailure::Permanent(error) => error,
            StepFailure::ExhaustedRetries { last, .. } => last,
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Permanent(error) => write!(f, "{error}"),
            StepFailure::ExhaustedRetries { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let policy = RetryPolicy::new(6, Duration::from_millis(100), Duration::from_millis(350))
            .with_jitter(false);

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
        assert_eq!(policy.delay(10), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_a_quarter_below_the_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_millis(400), Duration::from_secs(10));

        for _ in 0..50 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_millis(600), "{delay:?}");
            assert!(delay <= Duration::from_millis(800), "{delay:?}");
        }
    }

    #[test]
    fn only_transient_errors_are_retried_within_the_bound() {
        let policy = RetryPolicy::immediate(3);
        let transient = ClientError::transient("vm", "503");
        let permanent = ClientError::permanent("vm", "invalid-quota");

        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(1, &permanent));
        assert!(!policy.should_retry(1, &ClientError::not_found("vm", "gone")));
    }

    #[test]
    fn failures_describe_their_cause() {
        let exhausted = StepFailure::ExhaustedRetries {
            attempts: 5,
            last: ClientError::transient("auth", "timed out"),
        };
        assert!(exhausted.to_string().contains("after 5 attempts"));
        assert!(exhausted.to_string().contains("timed out"));
        assert!(StepFailure::Permanent(ClientError::permanent("vm", "invalid-quota"))
            .to_string()
            .contains("invalid-quota"));
    }
}
