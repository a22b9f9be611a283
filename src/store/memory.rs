use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Notify, time::Instant};
use tracing::debug;

use super::{Event, EventChannel, KeyValueStore, SessionService};
use crate::error::StoreError;

struct Entry {
    value: Option<String>,
    holder: Option<String>,
}

struct Session {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    sessions: HashMap<String, Session>,
    events: Vec<Event>,
}

impl State {
    fn session_alive(&self, id: &str, now: Instant) -> bool {
        self.sessions
            .get(id)
            .map_or(false, |session| session.expires_at > now)
    }

    /// Drops claims held by sessions that no longer exist or have expired.
    fn reap(&mut self, now: Instant) {
        self.sessions.retain(|_, session| session.expires_at > now);
        let sessions = &self.sessions;
        for entry in self.entries.values_mut() {
            if let Some(holder) = &entry.holder {
                if !sessions.contains_key(holder) {
                    entry.holder = None;
                }
            }
        }
        self.entries
            .retain(|_, entry| entry.value.is_some() || entry.holder.is_some());
    }
}

/// In-process coordination store. Sessions expire on tokio's clock, so tests
/// running with paused time observe expiry deterministically.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    event_fired: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned map is still structurally valid.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Session currently holding `key`, if any.
    pub fn holder(&self, key: &str) -> Option<String> {
        let mut state = self.state();
        state.reap(Instant::now());
        state.entries.get(key).and_then(|entry| entry.holder.clone())
    }

    pub fn live_sessions(&self) -> usize {
        let mut state = self.state();
        state.reap(Instant::now());
        state.sessions.len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .state()
            .entries
            .get(key)
            .and_then(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        let entry = state.entries.entry(key.to_string()).or_insert(Entry {
            value: None,
            holder: None,
        });
        entry.value = Some(value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.state().entries.remove(key);
        Ok(())
    }

    async fn acquire(&self, key: &str, session: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state();
        state.reap(now);
        if !state.session_alive(session, now) {
            return Err(StoreError::InvalidSession(session.to_string()));
        }

        let entry = state.entries.entry(key.to_string()).or_insert(Entry {
            value: None,
            holder: None,
        });
        match &entry.holder {
            Some(holder) if holder != session => Ok(false),
            _ => {
                entry.holder = Some(session.to_string());
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, session: &str) -> Result<bool, StoreError> {
        let mut state = self.state();
        state.reap(Instant::now());
        match state.entries.get_mut(key) {
            Some(entry) if entry.holder.as_deref() == Some(session) => {
                entry.holder = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl SessionService for MemoryStore {
    async fn create(&self, ttl: Duration) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.state().sessions.insert(
            id.clone(),
            Session {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        debug!(session = %id, ?ttl, "created session");
        Ok(id)
    }

    async fn renew(&self, session: &str) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.state();
        state.reap(now);
        match state.sessions.get_mut(session) {
            Some(live) => {
                live.expires_at = now + live.ttl;
                Ok(())
            }
            None => Err(StoreError::InvalidSession(session.to_string())),
        }
    }

    async fn destroy(&self, session: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.sessions.remove(session);
        state.reap(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl EventChannel for MemoryStore {
    async fn fire(&self, name: &str, payload: &str) -> Result<u64, StoreError> {
        let index = {
            let mut state = self.state();
            let index = state.events.len() as u64 + 1;
            state.events.push(Event {
                index,
                name: name.to_string(),
                payload: payload.to_string(),
            });
            index
        };
        self.event_fired.notify_waiters();
        Ok(index)
    }

    async fn list(&self, since: u64, wait: Duration) -> Result<(Vec<Event>, u64), StoreError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.event_fired.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state();
                let events: Vec<Event> = state
                    .events
                    .iter()
                    .filter(|event| event.index > since)
                    .cloned()
                    .collect();
                if !events.is_empty() {
                    let next = state.events.len() as u64;
                    return Ok((events, next));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok((Vec::new(), since));
            }
        }
    }
}
