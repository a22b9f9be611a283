//! Exclusive, expiring "operation in progress" records.
//!
//! An [`ActionChannel`] is a named scope holding at most one live [`Action`].
//! Every mutation happens under the channel's [`crate::lease::Lock`], so
//! `begin`, `save` and `end` are linearized across processes. Expiry is lazy:
//! readers drop an action whose `created_at + ttl` has passed.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ActionError, StoreError},
    store::KeyValueStore,
};

mod channel;
mod watcher;

pub use channel::{ActionChannel, DEFAULT_LOCK_TTL, GLOBAL_CHANNEL};
pub use watcher::{ActionObserver, ActionWatcher};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub name: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "ttl_ms", with = "millis")]
    pub ttl: Duration,
}

impl Action {
    pub fn new(name: impl Into<String>, data: serde_json::Value, ttl: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            data,
            created_at: Utc::now(),
            ttl,
        }
    }

    /// Expired once `created_at + ttl` lies strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match (now - self.created_at).to_std() {
            Ok(elapsed) => elapsed > self.ttl,
            // created in the future (clock skew between writers)
            Err(_) => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Reads and writes the single record stored for a channel.
#[derive(Clone)]
pub struct ActionStore {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl ActionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            kv,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The stored record, expired or not.
    pub async fn read(&self) -> Result<Option<Action>, ActionError> {
        match self.kv.get(&self.key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| {
                    ActionError::Store(StoreError::Malformed {
                        key: self.key.clone(),
                        reason: err.to_string(),
                    })
                }),
            None => Ok(None),
        }
    }

    pub async fn write(&self, action: &Action) -> Result<(), ActionError> {
        let raw = serde_json::to_string(action)?;
        self.kv.put(&self.key, &raw).await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<(), ActionError> {
        self.kv.delete(&self.key).await?;
        Ok(())
    }
}

mod millis {
    use std::{convert::TryFrom, time::Duration};

    use serde::{ser::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(ttl.as_millis()).map_err(S::Error::custom)?;
        serializer.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn expiry_is_strictly_after_ttl() {
        let action = Action::new("deploy", json!({}), Duration::from_secs(300));
        let t0 = action.created_at;

        assert!(!action.is_expired_at(t0 + chrono::Duration::seconds(299)));
        assert!(!action.is_expired_at(t0 + chrono::Duration::seconds(300)));
        assert!(action.is_expired_at(t0 + chrono::Duration::seconds(301)));
        assert!(!action.is_expired_at(t0 - chrono::Duration::seconds(5)));
    }

    #[tokio::test]
    async fn store_persists_the_record_as_json() {
        let kv = Arc::new(MemoryStore::new());
        let store = ActionStore::new(kv.clone(), "fleetshift/actions/global");
        let action = Action::new("deploy", json!({"service": "api"}), Duration::from_secs(300));

        store.write(&action).await.unwrap();

        let raw = kv.get("fleetshift/actions/global").await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["ttl_ms"], json!(300_000));
        assert_eq!(value["data"]["service"], json!("api"));
        assert_eq!(store.read().await.unwrap(), Some(action));

        store.delete().await.unwrap();
        assert_eq!(store.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn sub_second_ttl_survives_a_round_trip() {
        let kv = Arc::new(MemoryStore::new());
        let store = ActionStore::new(kv, "fleetshift/actions/global");
        let action = Action::new("deploy", json!({}), Duration::from_millis(500));

        store.write(&action).await.unwrap();
        let stored = store.read().await.unwrap().unwrap();

        assert_eq!(stored.ttl, Duration::from_millis(500));
        assert!(!stored.is_expired_at(stored.created_at + chrono::Duration::milliseconds(400)));
        assert!(stored.is_expired_at(stored.created_at + chrono::Duration::milliseconds(600)));
    }

    #[tokio::test]
    async fn malformed_record_is_reported() {
        let kv = Arc::new(MemoryStore::new());
        kv.put("actions/global", "not json").await.unwrap();
        let store = ActionStore::new(kv, "actions/global");

        assert!(matches!(
            store.read().await,
            Err(ActionError::Store(StoreError::Malformed { .. }))
        ));
    }
}
