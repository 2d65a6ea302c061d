//! Deadlines and cancellation for backend calls.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, Result, SyncError};

/// Await a backend call under an optional deadline and cancellation token.
pub(crate) async fn guarded<T, F>(
    call: F,
    deadline: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = Result<T, BackendError>>,
{
    let bounded = async {
        match deadline {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result.map_err(SyncError::from),
                Err(_) => Err(SyncError::Timeout(limit)),
            },
            None => call.await.map_err(SyncError::from),
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = bounded => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let cancel = CancellationToken::new();
        let call = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, BackendError>(1)
        };
        let result = guarded(call, Some(Duration::from_secs(5)), &cancel).await;
        assert!(matches!(result, Err(SyncError::Timeout(d)) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = guarded(futures::future::pending::<Result<u8, BackendError>>(), None, &cancel).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_backend_error_passes_through() {
        let cancel = CancellationToken::new();
        let call = async { Err::<u8, _>(BackendError::RateLimited) };
        let result = guarded(call, Some(Duration::from_secs(1)), &cancel).await;
        assert!(matches!(result, Err(SyncError::Backend(BackendError::RateLimited))));
    }
}
