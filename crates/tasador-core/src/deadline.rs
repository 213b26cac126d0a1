//! Timeouts around registry calls.

use std::future::Future;
use std::time::Duration;

use tasador_state::{StorageError, StorageResult};

/// Run `call` with a deadline. Expiry surfaces as `StorageError::Unavailable`
/// so it classifies exactly like a refused connection.
pub async fn bounded<T, F>(limit: Duration, op: &str, call: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Unavailable(format!(
            "{} timed out after {}ms",
            op,
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expiry_is_unavailable() {
        let err = bounded(Duration::from_secs(1), "list_versions", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StorageError>(())
        })
        .await
        .unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("list_versions"));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let value = bounded(Duration::from_secs(1), "get_run", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
