//! Busy-retry wrapper: survive contention on a single-writer database.
use crate::errors::RepositoryError;
use sqlx::sqlite::SqlitePool;
use sqlx::{Sqlite, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run `body` inside a transaction, retrying the whole transaction (begin through
/// commit) on SQLite BUSY/LOCKED, up to `max_attempts` times with the backoff
/// schedule `10 * (attempt + 1) ms` when `BEGIN` itself is busy, `25 * (attempt + 1)
/// ms` when the callback's own statement reports busy. A non-busy error is returned
/// immediately, not retried.
pub async fn with_retry<F, Fut, T>(
    pool: &SqlitePool,
    max_attempts: u32,
    mut body: F,
) -> Result<T, RepositoryError>
where
    F: FnMut(Transaction<'static, Sqlite>) -> Fut,
    Fut: Future<Output = Result<(Transaction<'static, Sqlite>, T), RepositoryError>>,
{
    let mut last_err: Option<RepositoryError> = None;

    for attempt in 0..max_attempts.max(1) {
        let tx = match pool.begin().await {
            Ok(tx) => tx,
            Err(e) if RepositoryError::is_busy(&e) => {
                warn!(attempt, "BEGIN busy, retrying");
                tokio::time::sleep(Duration::from_millis(10 * (attempt as u64 + 1))).await;
                last_err = Some(RepositoryError::Busy(e.to_string()));
                continue;
            }
            Err(e) => return Err(RepositoryError::Database(e)),
        };

        match body(tx).await {
            Ok((tx, value)) => {
                if let Err(e) = tx.commit().await {
                    if RepositoryError::is_busy(&e) {
                        warn!(attempt, "commit busy, retrying");
                        tokio::time::sleep(Duration::from_millis(25 * (attempt as u64 + 1))).await;
                        last_err = Some(RepositoryError::Busy(e.to_string()));
                        continue;
                    }
                    return Err(RepositoryError::Database(e));
                }
                return Ok(value);
            }
            Err(RepositoryError::Busy(msg)) => {
                warn!(attempt, %msg, "transaction body busy, retrying");
                tokio::time::sleep(Duration::from_millis(25 * (attempt as u64 + 1))).await;
                last_err = Some(RepositoryError::Busy(msg));
                continue;
            }
            Err(other) => return Err(other),
        }
    }

    Err(RepositoryError::RetriesExhausted(format!(
        "transaction retries exhausted: {}",
        last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown".into())
    )))
}
