use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::watch;

use super::signalled;

/// Runs `runnable` repeatedly, pausing `delay` after each pass, until
/// `shutdown` flips to true. A pass in flight is abandoned on shutdown.
pub(crate) async fn run_with_fixed_delay<T: PeriodicRunnable>(
    runnable: Arc<T>,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = signalled(&mut shutdown) => break,
            _ = runnable.run_once() => {}
        }

        tokio::select! {
            _ = signalled(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    runnable.before_shutdown_complete().await;
}

#[async_trait]
pub(crate) trait PeriodicRunnable: Send + Sync {
    async fn run_once(&self);
    async fn before_shutdown_complete(&self) {}
}
