//! Poll-until-ready helper with a deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::retry::jittered;
use crate::{Error, Result};

/// Poll until `poll_fn` yields a value or `timeout` expires.
///
/// `poll_fn` returns `Ok(Some(T))` when ready, `Ok(None)` to keep waiting, and
/// `Err(_)` for a transient failure that is logged and polled again. The
/// interval is jittered by `jitter` (fraction, 0.0 for exact spacing).
pub async fn wait_for<T, F, Fut>(
    description: &str,
    timeout: Duration,
    poll_interval: Duration,
    jitter: f64,
    mut poll_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();

    loop {
        match poll_fn().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Poll error for {}, retrying...", description);
            }
        }

        if start.elapsed() >= timeout {
            return Err(Error::timeout(description, timeout));
        }

        tokio::time::sleep(jittered(poll_interval, jitter)).await;
    }
}
