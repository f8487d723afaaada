//! Timeout enforcement for store operations.
//!
//! Every call to the configuration backend carries a deadline. Expiry is
//! reported as its own error so callers can tell a slow backend from a
//! failing one.

use std::future::Future;
use std::time::Duration;

use crate::config::store::StoreError;

/// Run `fut` with a deadline, mapping expiry to [`StoreError::Timeout`].
pub async fn with_deadline<T, F>(op: &'static str, limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!(op, timeout_ms = limit.as_millis() as u64, "Store operation timed out");
            Err(StoreError::Timeout { op, after: limit })
        }
    }
}
