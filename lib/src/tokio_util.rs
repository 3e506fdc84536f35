//! Helpers bridging blocking filesystem work with Tokio.

use core::fmt::{Debug, Display};
use std::future::Future;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Flatten a nested Result<Result<T>>, defaulting to converting the
/// error type to an `anyhow::Error`.
pub(crate) fn flatten_anyhow<T, E>(r: std::result::Result<Result<T>, E>) -> Result<T>
where
    E: Display + Debug + Send + Sync + 'static,
{
    match r {
        Ok(x) => x,
        Err(e) => Err(anyhow::anyhow!(e)),
    }
}

/// A wrapper around [`tokio::task::spawn_blocking`] that flattens
/// nested results.
pub(crate) async fn spawn_blocking_flatten<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    flatten_anyhow(tokio::task::spawn_blocking(f).await)
}

/// Run a fallible future, returning [`Error::Cancelled`] as soon as the
/// token fires instead of waiting for completion.
pub(crate) async fn run_with_cancellation<F, R>(token: &CancellationToken, f: F) -> Result<R>
where
    F: Future<Output = Result<R>>,
{
    tokio::select! {
        r = f => r,
        _ = token.cancelled() => Err(Error::Cancelled.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancellation() {
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                token.cancel();
            }
        };
        let work = run_with_cancellation(&token, async {
            tokio::time::sleep(std::time::Duration::from_secs(200)).await;
            Ok(())
        });
        let (r, ()) = tokio::join!(work, canceller);
        assert!(matches!(
            r.unwrap_err().downcast_ref::<Error>(),
            Some(Error::Cancelled)
        ));
    }
}
