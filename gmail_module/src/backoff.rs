//! Transport-level retry. This layer only handles rate limits and server
//! errors from the Google APIs; business-level retry of whole messages is
//! the run coordinator's ledger, a separate concern.

use std::thread;
use std::time::Duration;

use tracing::warn;

const MAX_ATTEMPTS: u32 = 6;
const INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Statuses worth retrying: quota/rate limiting and transient server
/// failures.
pub fn retryable_status(status: u16) -> bool {
    matches!(status, 403 | 429 | 500 | 503)
}

/// Run `op` with bounded exponential backoff (1s start, doubling, 6
/// attempts). `retryable` decides which errors are transient; anything
/// else is returned immediately.
pub fn with_backoff<T, E: std::fmt::Display>(
    op: impl FnMut() -> Result<T, E>,
    retryable: impl Fn(&E) -> bool,
) -> Result<T, E> {
    with_backoff_from(INITIAL_DELAY, op, retryable)
}

pub(crate) fn with_backoff_from<T, E: std::fmt::Display>(
    initial_delay: Duration,
    mut op: impl FnMut() -> Result<T, E>,
    retryable: impl Fn(&E) -> bool,
) -> Result<T, E> {
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_ATTEMPTS && retryable(&err) => {
                warn!(
                    "transient api error (attempt {attempt}): {err}; retrying in {:.1}s",
                    delay.as_secs_f64()
                );
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MailError;
    use std::cell::Cell;

    fn rate_limited() -> MailError {
        MailError::Api {
            status: 429,
            message: "quotaExceeded".to_string(),
        }
    }

    fn retryable_mail_error(err: &MailError) -> bool {
        matches!(err, MailError::Api { status, .. } if retryable_status(*status))
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result = with_backoff_from(
            Duration::from_millis(1),
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(rate_limited())
                } else {
                    Ok(42)
                }
            },
            retryable_mail_error,
        );
        assert_eq!(result.expect("value"), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_after_six_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), MailError> = with_backoff_from(
            Duration::from_millis(1),
            || {
                calls.set(calls.get() + 1);
                Err(rate_limited())
            },
            retryable_mail_error,
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 6);
    }

    #[test]
    fn non_retryable_errors_surface_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), MailError> = with_backoff(
            || {
                calls.set(calls.get() + 1);
                Err(MailError::Api {
                    status: 404,
                    message: "missing".to_string(),
                })
            },
            retryable_mail_error,
        );
        assert!(matches!(result, Err(MailError::Api { status: 404, .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retryable_statuses_match_rate_limit_and_server_errors() {
        for status in [403u16, 429, 500, 503] {
            assert!(retryable_status(status), "{status}");
        }
        for status in [200u16, 400, 401, 404, 409] {
            assert!(!retryable_status(status), "{status}");
        }
    }
}
