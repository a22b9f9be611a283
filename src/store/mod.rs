//! Narrow client interfaces onto the coordination store.
//!
//! The store provides three services: a key/value space with lease-guarded
//! conditional writes, a session (lease) service, and an event channel used to
//! wake watchers. Backends implement all three; callers receive them bundled
//! in a [`Coordination`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    config::StoreSettings,
    error::{ConfigError, StoreError},
};

pub mod dynamo;
pub mod memory;

pub use dynamo::DynamoStore;
pub use memory::MemoryStore;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Claims `key` for `session`. Succeeds only if the key is unclaimed or
    /// already claimed by the same session.
    async fn acquire(&self, key: &str, session: &str) -> Result<bool, StoreError>;

    /// Drops the claim on `key` if, and only if, `session` holds it.
    async fn release(&self, key: &str, session: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SessionService: Send + Sync {
    /// Creates a session that expires `ttl` after creation unless renewed.
    async fn create(&self, ttl: Duration) -> Result<String, StoreError>;

    /// Pushes the session's expiry out by its ttl. Fails with
    /// [`StoreError::InvalidSession`] once the session has expired.
    async fn renew(&self, session: &str) -> Result<(), StoreError>;

    /// Destroys the session, releasing every key it holds.
    async fn destroy(&self, session: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub index: u64,
    pub name: String,
    pub payload: String,
}

#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Publishes an event and returns its index.
    async fn fire(&self, name: &str, payload: &str) -> Result<u64, StoreError>;

    /// Returns events with an index greater than `since`, blocking up to
    /// `wait` for one to arrive, together with the index to pass next time.
    async fn list(&self, since: u64, wait: Duration) -> Result<(Vec<Event>, u64), StoreError>;
}

/// The coordination store services, injected into locks and channels.
#[derive(Clone)]
pub struct Coordination {
    pub kv: Arc<dyn KeyValueStore>,
    pub sessions: Arc<dyn SessionService>,
    pub events: Arc<dyn EventChannel>,
    pub key_prefix: String,
}

impl Coordination {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        sessions: Arc<dyn SessionService>,
        events: Arc<dyn EventChannel>,
    ) -> Self {
        Self {
            kv,
            sessions,
            events,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Uses one backend for all three services.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: KeyValueStore + SessionService + EventChannel + 'static,
    {
        Self::new(backend.clone(), backend.clone(), backend)
    }

    /// Uses one backend for all three services, namespaced by the configured
    /// key prefix.
    pub fn from_settings<B>(backend: Arc<B>, settings: &StoreSettings) -> Self
    where
        B: KeyValueStore + SessionService + EventChannel + 'static,
    {
        Self::from_backend(backend).with_key_prefix(settings.key_prefix.clone())
    }

    /// DynamoDB-backed coordination for the configured table and region.
    pub fn dynamo(settings: &StoreSettings) -> Result<Self, ConfigError> {
        let store = DynamoStore::from_settings(settings)?;
        Ok(Self::from_settings(Arc::new(store), settings))
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub(crate) fn key(&self, section: &str, name: &str) -> String {
        if self.key_prefix.is_empty() {
            format!("{}/{}", section, name)
        } else {
            format!("{}/{}/{}", self.key_prefix, section, name)
        }
    }
}

pub const DEFAULT_KEY_PREFIX: &str = "fleetshift";
