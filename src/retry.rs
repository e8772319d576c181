//! Retry logic module.
//!
//! Retry with exponential backoff for the two operations that contend with
//! other processes: taking the data file lock and writing to the archive
//! database.

use crate::config::RetrySettings;
use crate::error::{Result, TrackerError};
use log::debug;
use std::thread;
use std::time::Duration;

/// Backoff policy for one class of operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Factor to multiply delay by after each attempt
    pub backoff_factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts.max(1),
            initial_delay_ms: settings.initial_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            backoff_factor: settings.backoff_factor,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_factor: 1.0,
        }
    }

    fn next_delay(&self, current: u64) -> u64 {
        ((current as f32 * self.backoff_factor) as u64).min(self.max_delay_ms)
    }
}

/// Check if an error is worth another attempt
pub fn is_retryable_error(error: &TrackerError) -> bool {
    match error {
        // I/O errors are often transient
        TrackerError::Io(_) => true,
        // Another process holds the data file lock
        TrackerError::LockFailed(_) => true,
        // Database busy errors are retryable
        TrackerError::Database(e) => {
            let error_string = e.to_string().to_lowercase();
            error_string.contains("busy")
                || error_string.contains("locked")
                || error_string.contains("timeout")
        }
        _ => false,
    }
}

/// Retry a fallible operation with exponential backoff
pub fn retry_with_backoff<F, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    retry_while(policy, operation, |_| true)
}

/// Retry only while the error is retryable
pub fn retry_if_retryable<F, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    retry_while(policy, operation, is_retryable_error)
}

fn retry_while<F, T, P>(policy: &RetryPolicy, mut operation: F, should_retry: P) -> Result<T>
where
    F: FnMut() -> Result<T>,
    P: Fn(&TrackerError) -> bool,
{
    let mut current_delay = policy.initial_delay_ms;
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }
                last_error = Some(e);

                // Don't sleep after the last attempt
                if attempt < policy.max_attempts {
                    debug!(
                        "Attempt {}/{} failed, retrying in {}ms...",
                        attempt, policy.max_attempts, current_delay
                    );
                    thread::sleep(Duration::from_millis(current_delay));
                    current_delay = policy.next_delay(current_delay);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| TrackerError::other("Retry failed with no error information")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn test_retry_success_on_third_attempt() {
        let attempts = AtomicUsize::new(0);

        let result = retry_with_backoff(&fast(5), || {
            let count = attempts.fetch_add(1, Ordering::SeqCst);
            if count < 2 {
                Err(TrackerError::lock("held elsewhere"))
            } else {
                Ok(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_all_attempts_fail() {
        let attempts = AtomicUsize::new(0);

        let result = retry_with_backoff(&fast(3), || -> Result<i32> {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TrackerError::other("Permanent failure"))
        });

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_retryable_error_stops_immediately() {
        let attempts = AtomicUsize::new(0);

        let result = retry_if_retryable(&fast(4), || -> Result<i32> {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TrackerError::Config("bad value".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_is_retryable_error() {
        let io_error = TrackerError::Io(io::Error::new(io::ErrorKind::TimedOut, "timeout"));
        assert!(is_retryable_error(&io_error));
        assert!(is_retryable_error(&TrackerError::lock("busy")));
        assert!(!is_retryable_error(&TrackerError::archive("schema mismatch")));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = fast(10);
        assert_eq!(policy.next_delay(5), 10);
        assert_eq!(policy.next_delay(15), 20);
    }
}
