//! Retry helpers for transactional store operations.

use std::borrow::Cow;
use std::future::Future;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::RetryPolicy;
use crate::{Error, Result};

/// Whether an error is a lock/abort class failure (SQLITE_BUSY / SQLITE_LOCKED).
pub fn is_contention_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        let msg = sqlx_err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Run `op` and retry it on contention with exponential backoff plus jitter.
///
/// `op` must be a whole transaction: every attempt starts from scratch. Once
/// `policy.max_retries` is exhausted the failure surfaces as
/// [`Error::StoreContention`]; any other error is returned unchanged.
pub async fn retry_on_contention<T, F, Fut>(
    op_name: &'static str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_contention_error(&err) => {
                if !policy.should_retry(attempt) {
                    warn!(
                        operation = op_name,
                        attempts = attempt + 1,
                        error = %err,
                        "Store contention retries exhausted"
                    );
                    return Err(Error::StoreContention {
                        operation: op_name,
                        attempts: attempt + 1,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    "Store contention during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    policy.max_retries
                );

                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
