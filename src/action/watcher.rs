use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use super::{Action, ActionChannel};
use crate::util::runnable::{run_with_fixed_delay, PeriodicRunnable};

const LONG_POLL_WAIT: Duration = Duration::from_secs(30);
const POLL_DELAY: Duration = Duration::from_secs(1);

#[async_trait]
pub trait ActionObserver: Send + Sync {
    async fn action_begun(&self, action: &Action);
}

/// Long-polls the event channel and reports every action begun on a channel.
pub struct ActionWatcher {
    channel: ActionChannel,
    observer: Arc<dyn ActionObserver>,
    index: AtomicU64,
    wait: Duration,
}

impl ActionWatcher {
    pub fn new(channel: ActionChannel, observer: Arc<dyn ActionObserver>) -> Self {
        Self {
            channel,
            observer,
            index: AtomicU64::new(0),
            wait: LONG_POLL_WAIT,
        }
    }

    /// Skips events up to and including `index`.
    pub fn starting_after(self, index: u64) -> Self {
        self.index.store(index, Ordering::SeqCst);
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn index(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    /// Runs until `shutdown` reads true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(run_with_fixed_delay(Arc::new(self), POLL_DELAY, shutdown))
    }
}

#[async_trait]
impl PeriodicRunnable for ActionWatcher {
    async fn run_once(&self) {
        let since = self.index();
        match self.channel.begun_since(since, self.wait).await {
            Ok((actions, next)) => {
                self.index.store(next, Ordering::SeqCst);
                for action in &actions {
                    self.observer.action_begun(action).await;
                }
            }
            Err(err) => warn!(
                channel = %self.channel.name(),
                since,
                error = %err,
                "failed to poll action events"
            ),
        }
    }

    async fn before_shutdown_complete(&self) {
        debug!(channel = %self.channel.name(), index = self.index(), "action watcher stopped");
    }
}
