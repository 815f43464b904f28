use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Runs `future` with a deadline. On expiry the future is dropped.
///
/// # Errors
///
/// Returns [`Error::Timeout`] naming `operation` when `limit` elapses first,
/// otherwise whatever `future` resolves to.
pub async fn with_timeout<T, Fut>(operation: &str, limit: Duration, future: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    if let Ok(outcome) = tokio::time::timeout(limit, future).await {
        outcome
    } else {
        debug!(operation, limit_ms = limit.as_millis(), "operation timed out");
        Err(Error::Timeout {
            operation: operation.to_string(),
            after: limit,
        })
    }
}
