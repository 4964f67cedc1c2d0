use std::future::Future;
use std::time::Duration;

use tracing::warn;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn now_utc() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// Outcome of a bounded network call.
#[derive(Debug)]
pub enum RetryError<E> {
    TimedOut,
    Failed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::TimedOut => write!(f, "timed out"),
            RetryError::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Run `op` with a per-attempt timeout, retrying at most `max_retries` times.
///
/// Every network stage (model download, notarization, geocoding) goes through
/// here so none of them can block a request indefinitely.
pub async fn with_retry<T, E, F, Fut>(
    label: &str,
    timeout: Duration,
    max_retries: u32,
    mut op: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let last = match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(v)) => return Ok(v),
            Ok(Err(e)) => RetryError::Failed(e),
            Err(_) => RetryError::TimedOut,
        };
        if attempt >= max_retries {
            return Err(last);
        }
        attempt += 1;
        warn!(%label, attempt, error = %last, "retrying");
    }
}
