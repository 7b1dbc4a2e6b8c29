//! Retry with exponential backoff and jitter
//!
//! Host commands that pull data over the network (image pulls in particular)
//! fail transiently often enough that callers wrap them in
//! [`retry_with_backoff`]. The command runner itself never retries; the
//! policy lives with the caller.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Number of attempts for commands that pull data from the network
pub const NUM_RETRIES_NET_COMMANDS: u32 = 5;

/// Backoff policy for operations that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config with a bounded number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Policy for network-sensitive host commands
    pub fn net_commands() -> Self {
        Self::with_max_attempts(NUM_RETRIES_NET_COMMANDS)
    }
}

/// Run an async operation until it succeeds or `max_attempts` is exhausted.
///
/// The delay doubles (by `backoff_multiplier`) after every failure, capped at
/// `max_delay`, with 0.5x-1.5x jitter. The last error is returned when the
/// attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn net_commands_policy_is_bounded() {
        assert_eq!(RetryConfig::net_commands().max_attempts, 5);
    }

    #[tokio::test]
    async fn flaky_pull_succeeds_on_third_attempt() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<&str, String> = retry_with_backoff(&fast(5), "podman pull", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("registry timeout".to_string())
                } else {
                    Ok("pulled")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("pulled"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), String> = retry_with_backoff(&fast(5), "podman pull", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("unauthorized".to_string())
            }
        })
        .await;

        assert_eq!(result, Err("unauthorized".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
