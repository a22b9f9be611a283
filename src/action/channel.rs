use std::{collections::HashSet, future::Future, time::Duration};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{Action, ActionStore};
use crate::{
    error::{ActionError, LockError},
    lease::Lock,
    store::Coordination,
};

pub const GLOBAL_CHANNEL: &str = "global";
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15);

tokio::task_local! {
    /// Channels whose lock the current task already holds.
    static HELD_CHANNELS: HashSet<String>;
}

/// A named scope in which at most one live [`Action`] exists.
#[derive(Clone)]
pub struct ActionChannel {
    name: String,
    coordination: Coordination,
    store: ActionStore,
    lock_ttl: Duration,
}

impl ActionChannel {
    pub fn new(name: impl Into<String>, coordination: &Coordination) -> Self {
        let name = name.into();
        Self {
            store: ActionStore::new(coordination.kv.clone(), coordination.key("actions", &name)),
            coordination: coordination.clone(),
            lock_ttl: DEFAULT_LOCK_TTL,
            name,
        }
    }

    pub fn global(coordination: &Coordination) -> Self {
        Self::new(GLOBAL_CHANNEL, coordination)
    }

    pub fn service(service: &str, coordination: &Coordination) -> Self {
        Self::new(format!("service:{}", service), coordination)
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Name of the event fired when an action begins on this channel.
    pub fn event_name(&self) -> String {
        format!("action:{}", self.name)
    }

    /// Runs `body` while holding the channel's lock.
    ///
    /// Nested calls from the same task reuse the outer hold instead of
    /// acquiring again; the lock is released when the outermost call returns.
    pub async fn synchronize<F, Fut, T, E>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let reentrant = HELD_CHANNELS
            .try_with(|held| held.contains(&self.name))
            .unwrap_or(false);
        if reentrant {
            debug!(channel = %self.name, "reusing held channel lock");
            return body().await;
        }

        let mut held = HELD_CHANNELS
            .try_with(|held| held.clone())
            .unwrap_or_default();
        held.insert(self.name.clone());

        let lock = Lock::new(
            format!("actions/{}", self.name),
            self.lock_ttl,
            &self.coordination,
        );
        lock.synchronize(|| HELD_CHANNELS.scope(held, body())).await
    }

    /// Starts a new action unless a live one already occupies the channel.
    pub async fn begin(
        &self,
        action_name: &str,
        ttl: Duration,
        data: serde_json::Value,
    ) -> Result<Option<Action>, ActionError> {
        self.synchronize(|| async {
            if let Some(current) = self.current().await? {
                debug!(
                    channel = %self.name,
                    current = %current.id,
                    action = %current.name,
                    "channel is busy"
                );
                return Ok(None);
            }

            let action = Action::new(action_name, data, ttl);
            self.store.write(&action).await?;
            self.announce(&action).await;
            info!(
                channel = %self.name,
                action = %action.name,
                id = %action.id,
                "action begun"
            );
            Ok(Some(action))
        })
        .await
    }

    /// Persists the holder's copy of `action` and refreshes its `created_at`.
    pub async fn save(&self, action: &Action) -> Result<Action, ActionError> {
        self.synchronize(|| async {
            match self.store.read().await? {
                None => {}
                Some(stored) if stored.id == action.id && !stored.is_expired() => {}
                Some(_) => return Err(self.expired(action)),
            }

            let mut saved = action.clone();
            saved.created_at = Utc::now();
            self.store.write(&saved).await?;
            debug!(channel = %self.name, id = %saved.id, "action saved");
            Ok(saved)
        })
        .await
    }

    /// Removes the stored action if it is `action`. Returns whether it did.
    pub async fn end(&self, action: &Action) -> Result<bool, ActionError> {
        self.synchronize(|| async {
            match self.store.read().await? {
                Some(stored) if stored.id == action.id => {
                    self.store.delete().await?;
                    info!(channel = %self.name, id = %action.id, "action ended");
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }

    /// The live action, if any. Not linearized with writers.
    pub async fn current(&self) -> Result<Option<Action>, ActionError> {
        Ok(self.store.read().await?.filter(|action| !action.is_expired()))
    }

    /// Pulls the stored `created_at` and `data` into the local copy.
    pub async fn refresh(&self, local: &mut Action) -> Result<(), ActionError> {
        match self.current().await? {
            Some(stored) if stored.id == local.id => {
                local.created_at = stored.created_at;
                local.data = stored.data;
                Ok(())
            }
            _ => Err(self.expired(local)),
        }
    }

    /// Begins an action, runs `body` with it and ends it afterwards, whether
    /// or not `body` succeeded. If the returned future is dropped mid-body the
    /// action stays until its ttl runs out.
    pub async fn run<F, Fut, T, E>(
        &self,
        action_name: &str,
        ttl: Duration,
        data: serde_json::Value,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Action) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ActionError>,
    {
        let action = self
            .begin(action_name, ttl, data)
            .await?
            .ok_or_else(|| ActionError::InProgress {
                channel: self.name.clone(),
            })?;
        let id = action.clone();

        let result = body(action).await;
        match self.end(&id).await {
            Ok(true) => {}
            Ok(false) => warn!(
                channel = %self.name,
                id = %id.id,
                "action was replaced before it ended"
            ),
            Err(err) if result.is_ok() => return Err(err.into()),
            Err(err) => warn!(
                channel = %self.name,
                id = %id.id,
                error = %err,
                "failed to end action"
            ),
        }
        result
    }

    /// Actions begun on this channel after event index `since`, waiting up to
    /// `wait` for one, and the index to resume from.
    pub async fn begun_since(
        &self,
        since: u64,
        wait: Duration,
    ) -> Result<(Vec<Action>, u64), ActionError> {
        let (events, next) = self.coordination.events.list(since, wait).await?;
        let event_name = self.event_name();
        let mut actions = Vec::new();
        for event in events.into_iter().filter(|event| event.name == event_name) {
            match serde_json::from_str(&event.payload) {
                Ok(action) => actions.push(action),
                Err(err) => warn!(
                    channel = %self.name,
                    index = event.index,
                    error = %err,
                    "ignoring malformed event"
                ),
            }
        }
        Ok((actions, next))
    }

    async fn announce(&self, action: &Action) {
        let payload = match serde_json::to_string(action) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(channel = %self.name, error = %err, "failed to encode action event");
                return;
            }
        };
        if let Err(err) = self.coordination.events.fire(&self.event_name(), &payload).await {
            warn!(channel = %self.name, id = %action.id, error = %err, "failed to announce action");
        }
    }

    fn expired(&self, action: &Action) -> ActionError {
        ActionError::Expired {
            channel: self.name.clone(),
            id: action.id,
        }
    }
}
