//! Step attempt timeouts

use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;

/// A bounded operation ran past its limit
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("step attempt timed out (ran for {elapsed:?}, limit {limit:?})")]
pub struct TimeoutError {
    /// How long the operation ran before being abandoned
    pub elapsed: Duration,
    /// The configured limit
    pub limit: Duration,
}

/// Run `future` for at most `limit`
///
/// The future is dropped when the limit elapses; callers treat the
/// resulting [`TimeoutError`] like any other transient handler failure.
pub async fn with_timeout<F, T>(limit: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| TimeoutError {
            elapsed: started.elapsed(),
            limit,
        })
}
