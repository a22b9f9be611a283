use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Lease, LeaseClient};
use crate::{
    error::LockError,
    store::{Coordination, KeyValueStore},
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Named mutual exclusion backed by a lease.
///
/// Exclusion comes from the store's conditional acquire write; nothing on the
/// client side is trusted. A lock returned from [`Lock::acquire`] always has at
/// least 95% of its ttl left on the lease.
pub struct Lock {
    name: String,
    key: String,
    ttl: Duration,
    kv: Arc<dyn KeyValueStore>,
    leases: LeaseClient,
    lease: Option<Lease>,
    held: bool,
    expires_at: Option<Instant>,
}

impl Lock {
    pub fn new(name: impl Into<String>, ttl: Duration, coordination: &Coordination) -> Self {
        let name = name.into();
        Self {
            key: coordination.key("locks", &name),
            name,
            ttl,
            kv: coordination.kv.clone(),
            leases: LeaseClient::new(coordination.sessions.clone()),
            lease: None,
            held: false,
            expires_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Estimated expiry of the backing lease.
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// `ttl / 100`, clamped to [10ms, 1s].
    pub fn poll_interval(&self) -> Duration {
        (self.ttl / 100).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
    }

    /// Blocks until the lock is held.
    ///
    /// Transient store errors count as a failed attempt. The lease is renewed
    /// whenever the time slept since its last renewal passes 90% of the ttl,
    /// and once more before returning if that time passed 5% of the ttl.
    pub async fn acquire(&mut self) -> Result<(), LockError> {
        if self.held {
            return Ok(());
        }
        if let Some(stale) = self.lease.take() {
            if let Err(err) = self.leases.destroy(stale).await {
                warn!(lock = %self.name, error = %err, "failed to destroy stale lease");
            }
        }

        let lease = self.leases.create(self.ttl).await?;
        self.lease = Some(lease.clone());
        self.expires_at = Some(Instant::now() + self.ttl);

        let interval = self.poll_interval();
        let mut since_renewal = Duration::ZERO;
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            match self.kv.acquire(&self.key, &lease.id).await {
                Ok(true) => break,
                Ok(false) => debug!(lock = %self.name, attempts, "lock is held elsewhere"),
                Err(err) if err.is_transient() => warn!(
                    lock = %self.name,
                    attempts,
                    error = %err,
                    "transient failure acquiring lock"
                ),
                Err(source) => {
                    return Err(LockError::Store {
                        name: self.name.clone(),
                        source,
                    })
                }
            }

            tokio::time::sleep(interval).await;
            since_renewal += interval;
            if since_renewal > self.ttl * 9 / 10 {
                self.renew_lease().await?;
                since_renewal = Duration::ZERO;
            }
        }

        if since_renewal > self.ttl / 20 {
            self.renew_lease().await?;
        }
        self.held = true;
        info!(lock = %self.name, lease = %lease.id, attempts, "lock acquired");
        Ok(())
    }

    /// Extends the lease backing a held lock. A failure means the lock can no
    /// longer be trusted.
    pub async fn renew(&mut self) -> Result<(), LockError> {
        if !self.held {
            return Err(LockError::NotHeld(self.name.clone()));
        }
        self.renew_lease().await
    }

    async fn renew_lease(&mut self) -> Result<(), LockError> {
        if let Some(lease) = &self.lease {
            self.leases.renew(lease).await?;
            self.expires_at = Some(Instant::now() + self.ttl);
        }
        Ok(())
    }

    /// Clears the key and destroys the lease. No-op if never acquired.
    pub async fn release(&mut self) -> Result<(), LockError> {
        let lease = match self.lease.take() {
            Some(lease) => lease,
            None => return Ok(()),
        };
        let was_held = std::mem::replace(&mut self.held, false);
        self.expires_at = None;

        let released = if was_held {
            self.kv
                .release(&self.key, &lease.id)
                .await
                .map(|_| ())
                .map_err(|source| LockError::Store {
                    name: self.name.clone(),
                    source,
                })
        } else {
            Ok(())
        };
        let lease_id = lease.id.clone();
        let destroyed = self.leases.destroy(lease).await;

        released?;
        destroyed?;
        info!(lock = %self.name, lease = %lease_id, "lock released");
        Ok(())
    }

    /// Runs `body` while holding the lock. The lock is released on every exit
    /// path; if this future is dropped, release happens in the background.
    pub async fn synchronize<F, Fut, T, E>(mut self, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.acquire().await?;
        let result = body().await;
        match self.release().await {
            Ok(()) => result,
            Err(err) if result.is_ok() => Err(err.into()),
            Err(err) => {
                warn!(lock = %self.name, error = %err, "failed to release lock after error");
                result
            }
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let lease = match self.lease.take() {
            Some(lease) => lease,
            None => return,
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(lock = %self.name, lease = %lease.id, "no runtime to release dropped lock");
                return;
            }
        };

        let kv = self.kv.clone();
        let leases = self.leases.clone();
        let key = std::mem::take(&mut self.key);
        let name = std::mem::take(&mut self.name);
        let held = self.held;
        handle.spawn(async move {
            if held {
                if let Err(err) = kv.release(&key, &lease.id).await {
                    warn!(lock = %name, error = %err, "failed to release dropped lock");
                }
            }
            if let Err(err) = leases.destroy(lease).await {
                warn!(lock = %name, error = %err, "failed to destroy lease of dropped lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        error::{LeaseError, StoreError},
        store::{MemoryStore, SessionService},
    };

    /// Refuses the first `refusals` acquire attempts and counts renewals.
    struct ContendedStore {
        inner: MemoryStore,
        refusals: AtomicUsize,
        transient_failures: AtomicUsize,
        attempts: AtomicUsize,
        renewals: AtomicUsize,
        renewals_fail: AtomicBool,
    }

    impl ContendedStore {
        fn new(refusals: usize, transient_failures: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                refusals: AtomicUsize::new(refusals),
                transient_failures: AtomicUsize::new(transient_failures),
                attempts: AtomicUsize::new(0),
                renewals: AtomicUsize::new(0),
                renewals_fail: AtomicBool::new(false),
            })
        }

        fn coordination(self: &Arc<Self>) -> Coordination {
            Coordination::new(self.clone(), self.clone(), Arc::new(MemoryStore::new()))
        }
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl KeyValueStore for ContendedStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn acquire(&self, key: &str, session: &str) -> Result<bool, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.transient_failures) {
                return Err(StoreError::Transient("connection reset".to_string()));
            }
            if take_one(&self.refusals) {
                return Ok(false);
            }
            self.inner.acquire(key, session).await
        }

        async fn release(&self, key: &str, session: &str) -> Result<bool, StoreError> {
            self.inner.release(key, session).await
        }
    }

    #[async_trait]
    impl SessionService for ContendedStore {
        async fn create(&self, ttl: Duration) -> Result<String, StoreError> {
            self.inner.create(ttl).await
        }

        async fn renew(&self, session: &str) -> Result<(), StoreError> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            if self.renewals_fail.load(Ordering::SeqCst) {
                return Err(StoreError::InvalidSession(session.to_string()));
            }
            self.inner.renew(session).await
        }

        async fn destroy(&self, session: &str) -> Result<(), StoreError> {
            self.inner.destroy(session).await
        }
    }

    #[test]
    fn poll_interval_is_clamped() {
        let coordination = Coordination::from_backend(Arc::new(MemoryStore::new()));
        let interval = |ttl| Lock::new("a", ttl, &coordination).poll_interval();
        assert_eq!(interval(Duration::from_millis(500)), Duration::from_millis(10));
        assert_eq!(interval(Duration::from_secs(15)), Duration::from_millis(150));
        assert_eq!(interval(Duration::from_secs(500)), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn long_wait_renews_once_before_acquiring() {
        let store = ContendedStore::new(91, 0);
        let mut lock = Lock::new("deploy", Duration::from_secs(15), &store.coordination());

        lock.acquire().await.unwrap();

        assert!(lock.is_held());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 92);
        assert_eq!(store.renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn short_wait_renews_once_after_acquiring() {
        let store = ContendedStore::new(6, 0);
        let mut lock = Lock::new("deploy", Duration::from_secs(15), &store.coordination());

        lock.acquire().await.unwrap();

        assert_eq!(store.attempts.load(Ordering::SeqCst), 7);
        assert_eq!(store.renewals.load(Ordering::SeqCst), 1);
        let remaining = lock.expires_at().unwrap() - Instant::now();
        assert_eq!(remaining, Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn brief_wait_does_not_renew() {
        let store = ContendedStore::new(5, 0);
        let mut lock = Lock::new("deploy", Duration::from_secs(15), &store.coordination());

        lock.acquire().await.unwrap();

        assert_eq!(store.renewals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewal_while_waiting_is_fatal() {
        let store = ContendedStore::new(91, 0);
        store.renewals_fail.store(true, Ordering::SeqCst);
        let mut lock = Lock::new("deploy", Duration::from_secs(15), &store.coordination());

        let result = lock.acquire().await;

        assert!(matches!(
            result,
            Err(LockError::Lease(LeaseError::Renew { .. }))
        ));
        assert!(!lock.is_held());
        assert_eq!(store.renewals.load(Ordering::SeqCst), 1);
        assert!(store.attempts.load(Ordering::SeqCst) < 92);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_acquire_gives_back_its_lease() {
        let store = Arc::new(MemoryStore::new());
        let coordination = Coordination::from_backend(store.clone());
        let mut holder = Lock::new("deploy", Duration::from_secs(15), &coordination);
        holder.acquire().await.unwrap();

        let waiter = Lock::new("deploy", Duration::from_secs(15), &coordination);
        let waited = tokio::time::timeout(
            Duration::from_secs(2),
            waiter.synchronize(|| async { Ok::<_, LockError>(()) }),
        )
        .await;
        assert!(waited.is_err());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.live_sessions(), 1);

        holder.release().await.unwrap();
        assert_eq!(store.live_sessions(), 0);
        assert_eq!(store.holder(&coordination.key("locks", "deploy")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_polled_through() {
        let store = ContendedStore::new(0, 3);
        let mut lock = Lock::new("deploy", Duration::from_secs(15), &store.coordination());

        lock.acquire().await.unwrap();

        assert!(lock.is_held());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn second_holder_waits_for_release() {
        let store = Arc::new(MemoryStore::new());
        let coordination = Coordination::from_backend(store.clone());
        let mut first = Lock::new("deploy", Duration::from_secs(15), &coordination);
        first.acquire().await.unwrap();

        let contender = coordination.clone();
        let waiter = tokio::spawn(async move {
            let mut second = Lock::new("deploy", Duration::from_secs(15), &contender);
            second.acquire().await.unwrap();
            second
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        first.release().await.unwrap();
        let mut second = waiter.await.unwrap();
        assert!(second.is_held());
        assert_eq!(
            store.holder(&coordination.key("locks", "deploy")),
            second.lease().map(|lease| lease.id.clone())
        );
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_without_acquire_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let coordination = Coordination::from_backend(store.clone());
        let mut lock = Lock::new("deploy", Duration::from_secs(15), &coordination);

        lock.release().await.unwrap();

        assert_eq!(store.live_sessions(), 0);
    }

    #[tokio::test]
    async fn synchronize_releases_after_body_error() {
        let store = Arc::new(MemoryStore::new());
        let coordination = Coordination::from_backend(store.clone());
        let lock = Lock::new("deploy", Duration::from_secs(15), &coordination);

        let result: Result<(), LockError> = lock
            .synchronize(|| async { Err(LockError::NotHeld("body".to_string())) })
            .await;

        assert!(result.is_err());
        assert_eq!(store.holder(&coordination.key("locks", "deploy")), None);
        assert_eq!(store.live_sessions(), 0);
    }

    #[tokio::test]
    async fn dropped_lock_is_released_in_the_background() {
        let store = Arc::new(MemoryStore::new());
        let coordination = Coordination::from_backend(store.clone());
        let mut lock = Lock::new("deploy", Duration::from_secs(15), &coordination);
        lock.acquire().await.unwrap();

        drop(lock);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(store.holder(&coordination.key("locks", "deploy")), None);
        assert_eq!(store.live_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn renewing_an_unheld_lock_fails() {
        let coordination = Coordination::from_backend(Arc::new(MemoryStore::new()));
        let mut lock = Lock::new("deploy", Duration::from_secs(15), &coordination);

        assert!(matches!(lock.renew().await, Err(LockError::NotHeld(_))));
    }
}
