//! Bounded retry for transient write races
//!
//! Ledger writes race other writers on the same document. A lost race or a
//! busy database is retried with exponential backoff, each attempt starting
//! from a fresh read. After `max_attempts` the caller gets
//! `Error::PersistenceConflict`, which the API reports as retryable.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};

const MAX_BACKOFF: Duration = Duration::from_millis(1000);

/// True for errors worth retrying
pub fn is_transient(err: &Error) -> bool {
    match err {
        Error::PersistenceConflict { .. } => true,
        Error::Database(db_err) => {
            let text = db_err.to_string();
            text.contains("database is locked") || text.contains("database table is locked")
        }
        _ => false,
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts
pub async fn retry_on_conflict<F, Fut, T>(
    operation_name: &str,
    max_attempts: u32,
    initial_backoff: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_attempts = max_attempts.max(1);
    let mut backoff = initial_backoff;
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Write succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !is_transient(&err) => return Err(err),
            Err(err) => {
                if attempt >= max_attempts {
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        error = %err,
                        "Write still conflicting, giving up"
                    );
                    return Err(Error::PersistenceConflict { attempts: attempt });
                }

                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Write conflicted, retrying after backoff"
                );

                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_after_conflicts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result = retry_on_conflict("test", 3, Duration::from_millis(1), || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::PersistenceConflict { attempts: 1 })
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_attempt_count() {
        let result: Result<()> = retry_on_conflict("test", 2, Duration::from_millis(1), || async {
            Err(Error::PersistenceConflict { attempts: 1 })
        })
        .await;

        match result {
            Err(Error::PersistenceConflict { attempts }) => assert_eq!(attempts, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict("test", 5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::NotFound("doc".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
