use std::time::Duration;

use futures_retry::{ErrorHandler, RetryPolicy};
use tracing::debug;

use crate::error::StoreError;

/// Retries up to `max_attempts` total attempts, waiting `delay` between them,
/// for errors accepted by `should_retry`.
pub(crate) struct FixedCountWithDelayStrategy<E> {
    max_attempts: usize,
    delay: Duration,
    should_retry: fn(&E) -> bool,
    operation: &'static str,
}

impl<E> FixedCountWithDelayStrategy<E> {
    pub(crate) fn new(
        operation: &'static str,
        max_attempts: usize,
        delay: Duration,
        should_retry: fn(&E) -> bool,
    ) -> Self {
        Self {
            max_attempts,
            delay,
            should_retry,
            operation,
        }
    }
}

impl FixedCountWithDelayStrategy<StoreError> {
    /// Store calls retry only transient failures.
    pub(crate) fn for_store(operation: &'static str) -> Self {
        Self::new(
            operation,
            STORE_ATTEMPTS,
            STORE_RETRY_DELAY,
            StoreError::is_transient,
        )
    }
}

pub(crate) const STORE_ATTEMPTS: usize = 3;
pub(crate) const STORE_RETRY_DELAY: Duration = Duration::from_millis(200);

impl<E: std::fmt::Display> ErrorHandler<E> for FixedCountWithDelayStrategy<E> {
    type OutError = E;

    fn handle(&mut self, attempt: usize, e: E) -> RetryPolicy<E> {
        if attempt >= self.max_attempts || !(self.should_retry)(&e) {
            return RetryPolicy::ForwardError(e);
        }

        debug!(
            operation = self.operation,
            attempt,
            error = %e,
            "retrying after failure"
        );
        RetryPolicy::WaitRetry(self.delay)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use futures_retry::FutureRetry;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_the_bound() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<((), usize), (StoreError, usize)> = FutureRetry::new(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::Transient("timeout".to_string()))
                }
            },
            FixedCountWithDelayStrategy::for_store("get"),
        )
        .await;

        let (err, attempts) = result.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(attempts, STORE_ATTEMPTS);
        assert_eq!(calls.load(Ordering::SeqCst), STORE_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_forwarded_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<((), usize), (StoreError, usize)> = FutureRetry::new(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::Backend("access denied".to_string()))
                }
            },
            FixedCountWithDelayStrategy::for_store("put"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
