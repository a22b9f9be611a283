//! DynamoDB-backed coordination store.
//!
//! Everything lives in one table keyed by the string attribute `key`:
//!
//! - `kv/<key>`: `value`, plus `holder` and `expires_at` while claimed
//! - `session/<id>`: `ttl_ms` and `expires_at`
//! - `events/sequence`: the atomic event counter `seq`
//! - `event/<index>`: one published event
//!
//! A claim is taken with a conditional update that succeeds when the key is
//! unclaimed, already held by the caller, or held by a session past its
//! expiry. Renewing a session refreshes the expiry stamped on every key that
//! session claimed through this adapter.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    str::FromStr,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use dynomite::{
    dynamodb::{
        AttributeValue, DeleteItemError, DeleteItemInput, DynamoDb, DynamoDbClient, GetItemError,
        GetItemInput, PutItemError, PutItemInput, UpdateItemError, UpdateItemInput,
    },
    Attribute, Attributes, FromAttributes, Item,
};
use futures_retry::FutureRetry;
use rand::Rng;
use rusoto_core::{Region, RusotoError};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Event, EventChannel, KeyValueStore, SessionService};
use crate::{
    config::StoreSettings,
    error::{ConfigError, StoreError},
    util::retry::FixedCountWithDelayStrategy,
};

const SEQUENCE_KEY: &str = "events/sequence";
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_EVENT_BATCH: u64 = 100;

#[derive(Item, Debug, Clone)]
struct SessionItem {
    #[dynomite(partition_key)]
    key: String,
    ttl_ms: u64,
    expires_at: u64,
}

#[derive(Item, Debug, Clone)]
struct EventItem {
    #[dynomite(partition_key)]
    key: String,
    index: u64,
    name: String,
    payload: String,
}

pub struct DynamoStore {
    client: DynamoDbClient,
    table: String,
    /// Keys claimed through this adapter, per session.
    claims: Mutex<HashMap<String, HashSet<String>>>,
}

impl DynamoStore {
    pub fn new(client: DynamoDbClient, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &StoreSettings) -> Result<Self, ConfigError> {
        let region = Region::from_str(&settings.region)
            .map_err(|_| ConfigError::Region(settings.region.clone()))?;
        Ok(Self::new(DynamoDbClient::new(region), settings.table.clone()))
    }

    fn claimed_keys(&self, session: &str) -> Vec<String> {
        self.claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record_claim(&self, session: &str, key: &str, held: bool) {
        let mut claims = self
            .claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if held {
            claims
                .entry(session.to_string())
                .or_default()
                .insert(key.to_string());
        } else if let Some(keys) = claims.get_mut(session) {
            keys.remove(key);
            if keys.is_empty() {
                claims.remove(session);
            }
        }
    }

    fn forget_session(&self, session: &str) -> Vec<String> {
        self.claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default()
    }

    async fn get_attrs(&self, key: &str) -> Result<Option<Attributes>, StoreError> {
        let client = &self.client;
        let input = GetItemInput {
            table_name: self.table.clone(),
            key: key_attrs(key),
            consistent_read: Some(true),
            ..GetItemInput::default()
        };
        retried("get_item", move || {
            let input = input.clone();
            async move {
                client
                    .get_item(input)
                    .await
                    .map(|output| output.item)
                    .map_err(|err| {
                        classify(err, |e| {
                            matches!(
                                e,
                                GetItemError::InternalServerError(_)
                                    | GetItemError::ProvisionedThroughputExceeded(_)
                            )
                        })
                    })
            }
        })
        .await
    }

    /// Runs a conditional update. `Ok(None)` means the condition did not hold.
    async fn update(
        &self,
        key: &str,
        expression: &str,
        condition: Option<&str>,
        values: Option<Attributes>,
        return_values: Option<&str>,
    ) -> Result<Option<Attributes>, StoreError> {
        let client = &self.client;
        let mut names = HashMap::new();
        names.insert("#k".to_string(), "key".to_string());
        names.insert("#v".to_string(), "value".to_string());
        names.insert("#h".to_string(), "holder".to_string());
        names.insert("#e".to_string(), "expires_at".to_string());
        names.insert("#s".to_string(), "seq".to_string());
        names.retain(|alias, _| {
            expression.contains(alias.as_str())
                || condition.map_or(false, |c| c.contains(alias.as_str()))
        });
        let input = UpdateItemInput {
            table_name: self.table.clone(),
            key: key_attrs(key),
            update_expression: Some(expression.to_string()),
            condition_expression: condition.map(str::to_string),
            expression_attribute_names: if names.is_empty() { None } else { Some(names) },
            expression_attribute_values: values,
            return_values: return_values.map(str::to_string),
            ..UpdateItemInput::default()
        };
        retried("update_item", move || {
            let input = input.clone();
            async move {
                match client.update_item(input).await {
                    Ok(output) => Ok(Some(output.attributes.unwrap_or_default())),
                    Err(RusotoError::Service(UpdateItemError::ConditionalCheckFailed(_))) => {
                        Ok(None)
                    }
                    Err(err) => Err(classify(err, |e| {
                        matches!(
                            e,
                            UpdateItemError::InternalServerError(_)
                                | UpdateItemError::ProvisionedThroughputExceeded(_)
                        )
                    })),
                }
            }
        })
        .await
    }

    async fn put_item(
        &self,
        item: Attributes,
        condition: Option<&str>,
    ) -> Result<bool, StoreError> {
        let client = &self.client;
        let input = PutItemInput {
            table_name: self.table.clone(),
            item,
            condition_expression: condition.map(str::to_string),
            expression_attribute_names: condition.map(|_| {
                let mut names = HashMap::new();
                names.insert("#k".to_string(), "key".to_string());
                names
            }),
            ..PutItemInput::default()
        };
        retried("put_item", move || {
            let input = input.clone();
            async move {
                match client.put_item(input).await {
                    Ok(_) => Ok(true),
                    Err(RusotoError::Service(PutItemError::ConditionalCheckFailed(_))) => Ok(false),
                    Err(err) => Err(classify(err, |e| {
                        matches!(
                            e,
                            PutItemError::InternalServerError(_)
                                | PutItemError::ProvisionedThroughputExceeded(_)
                        )
                    })),
                }
            }
        })
        .await
    }

    async fn delete_item(&self, key: &str) -> Result<(), StoreError> {
        let client = &self.client;
        let input = DeleteItemInput {
            table_name: self.table.clone(),
            key: key_attrs(key),
            ..DeleteItemInput::default()
        };
        retried("delete_item", move || {
            let input = input.clone();
            async move {
                client.delete_item(input).await.map(|_| ()).map_err(|err| {
                    classify(err, |e| {
                        matches!(
                            e,
                            DeleteItemError::InternalServerError(_)
                                | DeleteItemError::ProvisionedThroughputExceeded(_)
                        )
                    })
                })
            }
        })
        .await
    }

    async fn session(&self, id: &str) -> Result<Option<SessionItem>, StoreError> {
        let key = session_key(id);
        match self.get_attrs(&key).await? {
            Some(attrs) => SessionItem::from_attrs(attrs)
                .map(Some)
                .map_err(|err| StoreError::Malformed {
                    key,
                    reason: err.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn sequence(&self) -> Result<u64, StoreError> {
        match self.get_attrs(SEQUENCE_KEY).await? {
            Some(mut attrs) => read_number(&mut attrs, "seq", SEQUENCE_KEY),
            None => Ok(0),
        }
    }

    async fn event(&self, index: u64) -> Result<Option<Event>, StoreError> {
        let key = event_key(index);
        match self.get_attrs(&key).await? {
            Some(attrs) => {
                let item = EventItem::from_attrs(attrs).map_err(|err| StoreError::Malformed {
                    key,
                    reason: err.to_string(),
                })?;
                Ok(Some(Event {
                    index: item.index,
                    name: item.name,
                    payload: item.payload,
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl KeyValueStore for DynamoStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get_attrs(&kv_key(key))
            .await?
            .and_then(|mut attrs| attrs.remove("value"))
            .and_then(|value| value.s))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = Attributes::new();
        values.insert(":v".to_string(), value.to_string().into_attr());
        self.update(&kv_key(key), "SET #v = :v", None, Some(values), None)
            .await
            .map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.delete_item(&kv_key(key)).await
    }

    async fn acquire(&self, key: &str, session: &str) -> Result<bool, StoreError> {
        let now = epoch_millis();
        let expires_at = match self.session(session).await? {
            Some(item) if item.expires_at > now => item.expires_at,
            _ => return Err(StoreError::InvalidSession(session.to_string())),
        };

        let mut values = Attributes::new();
        values.insert(":sid".to_string(), session.to_string().into_attr());
        values.insert(":exp".to_string(), expires_at.into_attr());
        values.insert(":now".to_string(), now.into_attr());
        let acquired = self
            .update(
                &kv_key(key),
                "SET #h = :sid, #e = :exp",
                Some("attribute_not_exists(#h) OR #h = :sid OR #e < :now"),
                Some(values),
                None,
            )
            .await?
            .is_some();
        if acquired {
            self.record_claim(session, key, true);
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str, session: &str) -> Result<bool, StoreError> {
        let mut values = Attributes::new();
        values.insert(":sid".to_string(), session.to_string().into_attr());
        let released = self
            .update(
                &kv_key(key),
                "REMOVE #h, #e",
                Some("#h = :sid"),
                Some(values),
                None,
            )
            .await?
            .is_some();
        self.record_claim(session, key, false);
        Ok(released)
    }
}

#[async_trait]
impl SessionService for DynamoStore {
    async fn create(&self, ttl: Duration) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let ttl_ms = ttl.as_millis() as u64;
        let item = SessionItem {
            key: session_key(&id),
            ttl_ms,
            expires_at: epoch_millis() + ttl_ms,
        };
        if !self
            .put_item(item.into(), Some("attribute_not_exists(#k)"))
            .await?
        {
            return Err(StoreError::Backend(format!("session id '{}' collided", id)));
        }
        debug!(session = %id, ?ttl, "created session");
        Ok(id)
    }

    async fn renew(&self, session: &str) -> Result<(), StoreError> {
        let current = self
            .session(session)
            .await?
            .ok_or_else(|| StoreError::InvalidSession(session.to_string()))?;
        let now = epoch_millis();
        let expires_at = now + current.ttl_ms;

        let mut values = Attributes::new();
        values.insert(":exp".to_string(), expires_at.into_attr());
        values.insert(":now".to_string(), now.into_attr());
        let renewed = self
            .update(
                &session_key(session),
                "SET #e = :exp",
                Some("attribute_exists(#k) AND #e > :now"),
                Some(values),
                None,
            )
            .await?;
        if renewed.is_none() {
            return Err(StoreError::InvalidSession(session.to_string()));
        }

        for key in self.claimed_keys(session) {
            let mut values = Attributes::new();
            values.insert(":sid".to_string(), session.to_string().into_attr());
            values.insert(":exp".to_string(), expires_at.into_attr());
            let refreshed = self
                .update(&kv_key(&key), "SET #e = :exp", Some("#h = :sid"), Some(values), None)
                .await?;
            if refreshed.is_none() {
                warn!(session, key = %key, "claim was taken over before renewal");
                self.record_claim(session, &key, false);
            }
        }
        Ok(())
    }

    async fn destroy(&self, session: &str) -> Result<(), StoreError> {
        for key in self.forget_session(session) {
            let mut values = Attributes::new();
            values.insert(":sid".to_string(), session.to_string().into_attr());
            self.update(&kv_key(&key), "REMOVE #h, #e", Some("#h = :sid"), Some(values), None)
                .await?;
        }
        self.delete_item(&session_key(session)).await
    }
}

#[async_trait]
impl EventChannel for DynamoStore {
    async fn fire(&self, name: &str, payload: &str) -> Result<u64, StoreError> {
        let mut values = Attributes::new();
        values.insert(":one".to_string(), 1u64.into_attr());
        let mut updated = self
            .update(SEQUENCE_KEY, "ADD #s :one", None, Some(values), Some("UPDATED_NEW"))
            .await?
            .unwrap_or_default();
        let index = read_number(&mut updated, "seq", SEQUENCE_KEY)?;

        let item = EventItem {
            key: event_key(index),
            index,
            name: name.to_string(),
            payload: payload.to_string(),
        };
        self.put_item(item.into(), None).await?;
        Ok(index)
    }

    async fn list(&self, since: u64, wait: Duration) -> Result<(Vec<Event>, u64), StoreError> {
        let deadline = Instant::now() + wait;
        loop {
            let sequence = self.sequence().await?;
            if sequence > since {
                let mut events = Vec::new();
                let mut next = since;
                for index in (since + 1)..=sequence.min(since + MAX_EVENT_BATCH) {
                    // The counter moves before the event item is written.
                    match self.event(index).await? {
                        Some(event) => {
                            next = index;
                            events.push(event);
                        }
                        None => break,
                    }
                }
                if !events.is_empty() {
                    return Ok((events, next));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok((Vec::new(), since));
            }
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
            tokio::time::sleep((EVENT_POLL_INTERVAL + jitter).min(deadline - now)).await;
        }
    }
}

async fn retried<T, F, Fut>(operation: &'static str, call: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut + Unpin,
    Fut: Future<Output = Result<T, StoreError>>,
{
    FutureRetry::new(call, FixedCountWithDelayStrategy::for_store(operation))
        .await
        .map(|(value, _)| value)
        .map_err(|(err, _)| err)
}

fn classify<E>(err: RusotoError<E>, throttled: fn(&E) -> bool) -> StoreError
where
    E: std::error::Error + 'static,
{
    match err {
        RusotoError::Service(service) if throttled(&service) => {
            StoreError::Transient(service.to_string())
        }
        RusotoError::HttpDispatch(dispatch) => StoreError::Transient(dispatch.to_string()),
        RusotoError::Unknown(response) if response.status.is_server_error() => {
            StoreError::Transient(format!("server error {}", response.status))
        }
        other => StoreError::Backend(other.to_string()),
    }
}

fn read_number(attrs: &mut Attributes, name: &str, key: &str) -> Result<u64, StoreError> {
    let value: AttributeValue = attrs.remove(name).ok_or_else(|| StoreError::Malformed {
        key: key.to_string(),
        reason: format!("missing '{}'", name),
    })?;
    u64::from_attr(value).map_err(|err| StoreError::Malformed {
        key: key.to_string(),
        reason: err.to_string(),
    })
}

fn key_attrs(key: &str) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("key".to_string(), key.to_string().into_attr());
    attrs
}

fn kv_key(key: &str) -> String {
    format!("kv/{}", key)
}

fn session_key(id: &str) -> String {
    format!("session/{}", id)
}

fn event_key(index: u64) -> String {
    format!("event/{:020}", index)
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
