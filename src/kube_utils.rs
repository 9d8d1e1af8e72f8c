//! Polling helpers shared by the controller components

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::Error;

/// Poll until `check_fn` yields a value or `timeout` elapses.
///
/// The first check runs immediately. `Ok(None)` means "not yet" and sleeps
/// `poll_interval` before the next attempt; an `Err` from the check stops
/// polling and is returned as is. On timeout a [`Error::NotReady`] carrying
/// `timeout_msg` is returned.
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let start = Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if let Some(value) = check_fn().await? {
            return Ok(value);
        }
        if start.elapsed() + poll_interval > timeout {
            return Err(Error::not_ready(timeout_msg));
        }
        trace!("Polling condition not yet met, retrying...");
        tokio::time::sleep(poll_interval).await;
    }
}
