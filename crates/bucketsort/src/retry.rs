use tracing::warn;

use crate::SortError;

/// Runs `op`, re-running it up to `retries` extra times while it fails with a
/// transient error (see [`SortError::is_transient`]).
///
/// Non-transient errors and the final transient error are returned as is.
pub fn with_retries<T, F>(retries: u32, what: &str, mut op: F) -> Result<T, SortError>
where
    F: FnMut() -> Result<T, SortError>,
{
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(%what, attempt, retries, error = %e, "transient read failure, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn retries_transient_until_success() {
        let mut calls = 0;
        let out = with_retries(3, "test", || {
            calls += 1;
            if calls < 3 {
                Err(SortError::Io(io::Error::from(io::ErrorKind::Interrupted)))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries(2, "test", || {
            calls += 1;
            Err(SortError::Io(io::Error::from(io::ErrorKind::TimedOut)))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries(5, "test", || {
            calls += 1;
            Err(SortError::Io(io::Error::from(io::ErrorKind::NotFound)))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
