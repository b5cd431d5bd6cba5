use std::{future::Future, time::Duration};

use crate::error::{Error, Result};

/// Spawn a task onto the tokio runtime. The task will run to completion even if the returned
/// handle is dropped.
pub(crate) fn spawn<F, O>(fut: F) -> tokio::task::JoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::task::spawn(fut)
}

/// Await on a future for a maximum amount of time before returning a timeout error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::network_timeout())
}

/// Pause for the given duration.
pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
