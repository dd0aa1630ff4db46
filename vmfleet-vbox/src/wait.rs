//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use crate::VboxError;

/// Poll `probe` every `interval` until it yields a value or `deadline` passes.
///
/// `Ok(None)` means "not yet" and is retried; an `Err` from the probe aborts
/// the wait immediately. Probes that treat some failures as transient must
/// map them to `Ok(None)` themselves.
///
/// # Errors
/// Returns [`VboxError::Timeout`] naming `what` when the deadline passes, or
/// the first error returned by `probe`.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    deadline: Duration,
    mut probe: F,
) -> Result<T, VboxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, VboxError>>,
{
    let attempt = async {
        loop {
            if let Some(value) = probe().await? {
                return Ok(value);
            }
            tokio::time::sleep(interval).await;
        }
    };
    match tokio::time::timeout(deadline, attempt).await {
        Ok(result) => result,
        Err(_) => Err(VboxError::Timeout {
            what: what.to_owned(),
            after: deadline,
        }),
    }
}
