//! Bounded retry with exponential backoff for transient failures.

use std::thread;
use std::time::Duration;

use log::warn;

use super::error::Result;

const MAX_DELAY: Duration = Duration::from_secs(30);

/// Delay before retry number `attempt` (0-based), doubling from `base`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_DELAY)
}

/// Run `op` until it succeeds, fails permanently, or `attempts` are used up.
///
/// Only errors with [`SwapperError::is_transient`] are retried.
pub fn retry_transient<T>(
    what: &str,
    attempts: u32,
    base: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = backoff_delay(base, attempt);
                warn!(
                    "[RETRY] {what} failed (attempt {}/{attempts}): {e}; retrying in {delay:?}",
                    attempt + 1
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swapper::error::SwapperError;
    use std::cell::Cell;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 40), MAX_DELAY);
    }

    #[test]
    fn test_retry_stops_on_success() {
        let calls = Cell::new(0);
        let result = retry_transient("op", 5, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(SwapperError::Io(std::io::Error::other("flaky")))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = retry_transient("op", 5, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            Err(SwapperError::EmptyBatch)
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_attempts_are_bounded() {
        let calls = Cell::new(0);
        let result: Result<()> = retry_transient("op", 3, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            Err(SwapperError::Io(std::io::Error::other("down")))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }
}
