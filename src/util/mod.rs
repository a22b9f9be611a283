use tokio::sync::watch;

pub(crate) mod retry;
pub(crate) mod runnable;

/// Resolves once the signal reads true. A dropped sender never signals.
pub(crate) async fn signalled(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
