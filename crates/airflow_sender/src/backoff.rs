use std::time::Duration;

use airflow_core::config::StartupConfig;
use tracing::warn;

/// Retry schedule for acquiring the device at startup.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub retries: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl From<&StartupConfig> for RetryPolicy {
    fn from(config: &StartupConfig) -> Self {
        let initial = Duration::from_millis(config.backoff_initial_ms.max(1));
        Self {
            retries: config.connect_retries.max(1),
            initial,
            max: Duration::from_millis(config.backoff_max_ms).max(initial),
        }
    }
}

/// Doubling delay capped at a maximum.
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max: max.max(initial),
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Runs `open` until it succeeds or the policy's retries are used up.
///
/// Returns the last error when every attempt failed.
pub fn connect_with_retry<T, E, F>(policy: &RetryPolicy, mut open: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let mut backoff = Backoff::new(policy.initial, policy.max);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match open() {
            Ok(value) => return Ok(value),
            Err(e) if attempt > policy.retries => return Err(e),
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    "connect attempt {attempt}/{} failed: {e}; retrying in {delay:?}",
                    policy.retries + 1
                );
                std::thread::sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_millis(1800));
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_millis(1000));
        assert_eq!(b.next_delay(), Duration::from_millis(1800));
        assert_eq!(b.next_delay(), Duration::from_millis(1800));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result: Result<&str, String> = connect_with_retry(&policy(3), || {
            calls += 1;
            if calls < 3 { Err("busy".into()) } else { Ok("port") }
        });
        assert_eq!(result, Ok("port"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_retries() {
        let mut calls = 0;
        let result: Result<(), String> = connect_with_retry(&policy(2), || {
            calls += 1;
            Err(format!("attempt {calls}"))
        });
        assert_eq!(result, Err("attempt 3".to_string()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn policy_always_retries_at_least_once() {
        let config = StartupConfig {
            connect_retries: 0,
            backoff_initial_ms: 0,
            backoff_max_ms: 0,
        };
        let p = RetryPolicy::from(&config);
        assert_eq!(p.retries, 1);
        assert_eq!(p.initial, Duration::from_millis(1));
        assert_eq!(p.max, Duration::from_millis(1));
    }
}
