use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{error::LeaseError, store::SessionService};

mod lock;

pub use lock::Lock;

/// A session issued by the coordination store. Each acquisition gets a fresh
/// id; ids are never reused after the lease is destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: String,
    pub ttl: Duration,
}

/// Create, renew and destroy leases against a [`SessionService`].
#[derive(Clone)]
pub struct LeaseClient {
    sessions: Arc<dyn SessionService>,
}

impl LeaseClient {
    pub fn new(sessions: Arc<dyn SessionService>) -> Self {
        Self { sessions }
    }

    pub async fn create(&self, ttl: Duration) -> Result<Lease, LeaseError> {
        let id = self.sessions.create(ttl).await.map_err(LeaseError::Create)?;
        debug!(lease = %id, ?ttl, "lease created");
        Ok(Lease { id, ttl })
    }

    pub async fn renew(&self, lease: &Lease) -> Result<(), LeaseError> {
        self.sessions
            .renew(&lease.id)
            .await
            .map_err(|source| LeaseError::Renew {
                id: lease.id.clone(),
                source,
            })?;
        debug!(lease = %lease.id, "lease renewed");
        Ok(())
    }

    pub async fn destroy(&self, lease: Lease) -> Result<(), LeaseError> {
        self.sessions
            .destroy(&lease.id)
            .await
            .map_err(|source| LeaseError::Destroy {
                id: lease.id.clone(),
                source,
            })?;
        debug!(lease = %lease.id, "lease destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::StoreError, store::MemoryStore};

    #[tokio::test(start_paused = true)]
    async fn renewing_an_expired_lease_fails() {
        let client = LeaseClient::new(Arc::new(MemoryStore::new()));
        let lease = client.create(Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        match client.renew(&lease).await {
            Err(LeaseError::Renew { id, source }) => {
                assert_eq!(id, lease.id);
                assert!(matches!(source, StoreError::InvalidSession(_)));
            }
            other => panic!("expected renewal failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn every_lease_gets_a_fresh_id() {
        let client = LeaseClient::new(Arc::new(MemoryStore::new()));
        let first = client.create(Duration::from_secs(10)).await.unwrap();
        let first_id = first.id.clone();
        client.destroy(first).await.unwrap();

        let second = client.create(Duration::from_secs(10)).await.unwrap();
        assert_ne!(first_id, second.id);
    }
}
