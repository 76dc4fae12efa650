/// Retrying execution of storage operations
use std::future::Future;

use crate::config::RetryPolicy;
use crate::storage::{StorageAdapter, StorageError};

/// Run `operation` against `adapter`, retrying transient failures
///
/// Before every attempt the adapter is reconnected if it reports itself
/// disconnected. Failed attempts are followed by a linear backoff
/// (`base_delay × attempt`). Errors that would fail the same way again are
/// returned at once; otherwise the last error is returned wrapped in
/// [`StorageError::RetriesExhausted`].
pub async fn execute_with_retry<A, F, Fut, T>(
    adapter: &A,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, StorageError>
where
    A: StorageAdapter + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let max_attempts = policy.max_retries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = if adapter.is_connected() {
            operation().await
        } else {
            tracing::debug!("{} backend not connected, reconnecting", adapter.kind());
            match adapter.connect().await {
                Ok(()) => operation().await,
                Err(e) => Err(e),
            }
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        tracing::warn!(
            "Storage operation failed (attempt {}/{}): {}",
            attempt,
            max_attempts,
            error
        );

        if attempt >= max_attempts {
            return Err(StorageError::RetriesExhausted {
                attempts: attempt,
                source: Box::new(error),
            });
        }

        tokio::time::sleep(policy.delay_for(attempt)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainError;
    use crate::storage::{StorageKind, StorageStats};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    /// Adapter whose connection state is driven by the test
    struct FlakyAdapter {
        connected: AtomicBool,
        connects: AtomicU32,
    }

    impl FlakyAdapter {
        fn new(connected: bool) -> Self {
            Self {
                connected: AtomicBool::new(connected),
                connects: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StorageAdapter for FlakyAdapter {
        fn kind(&self) -> StorageKind {
            StorageKind::DocumentStore
        }

        async fn connect(&self) -> Result<(), StorageError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), StorageError> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn health_check(&self) -> bool {
            self.is_connected()
        }

        async fn initialize_default_data(&self) -> Result<(), StorageError> {
            Ok(())
        }

        async fn get_stats(&self) -> Result<StorageStats, StorageError> {
            Ok(StorageStats {
                backend: StorageKind::DocumentStore,
                location: "memory".to_string(),
                collections: BTreeMap::new(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let adapter = FlakyAdapter::new(true);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = tokio::time::Instant::now();

        let result = execute_with_retry(&adapter, &RetryPolicy::default(), move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(StorageError::Connection("busy".to_string()))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        // 1000ms after the first failure, 2000ms after the second
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wraps_last_error_with_attempt_count() {
        let adapter = FlakyAdapter::new(true);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), _> = execute_with_retry(&adapter, &RetryPolicy::default(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Connection("down".to_string()))
        })
        .await;

        match result {
            Err(StorageError::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, StorageError::Connection(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_errors_are_not_retried() {
        let adapter = FlakyAdapter::new(true);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), _> = execute_with_retry(&adapter, &RetryPolicy::default(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Validation(DomainError::InvalidHour(99)))
        })
        .await;

        assert!(matches!(result, Err(StorageError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnects_before_attempt() {
        let adapter = FlakyAdapter::new(false);

        let result = execute_with_retry(&adapter, &RetryPolicy::default(), || async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(adapter.connects.load(Ordering::SeqCst), 1);
    }
}
