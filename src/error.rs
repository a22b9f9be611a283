use std::time::Duration;

use thiserror::Error;

use crate::rollout::SyncStatus;

/// Failure talking to the coordination store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Network, throttling or timeout. Safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The session named does not exist or has already expired.
    #[error("session '{0}' is not valid")]
    InvalidSession(String),
    #[error("malformed record at '{key}': {reason}")]
    Malformed { key: String, reason: String },
    #[error("store failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("failed to create lease: {0}")]
    Create(#[source] StoreError),
    #[error("failed to renew lease '{id}': {source}")]
    Renew {
        id: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to destroy lease '{id}': {source}")]
    Destroy {
        id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error("lock '{name}': {source}")]
    Store {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("lock '{0}' is not held")]
    NotHeld(String),
}

#[derive(Debug, Error)]
pub enum ActionError {
    /// The caller's copy of the action no longer matches the channel.
    #[error("action '{id}' on channel '{channel}' has expired or been replaced")]
    Expired { channel: String, id: uuid::Uuid },
    #[error("another action is in progress on channel '{channel}'")]
    InProgress { channel: String },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode action: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure reported by a fleet group manager.
#[derive(Debug, Clone, Error)]
pub enum FleetError {
    #[error("fleet group '{0}' not found")]
    NotFound(String),
    #[error("fleet group '{group}' did not reach capacity {capacity} within {waited:?}")]
    Timeout {
        group: String,
        capacity: u32,
        waited: Duration,
    },
    #[error("fleet provider failure: {0}")]
    Provider(String),
}

/// Failure reaching a health collaborator. Distinct from a negative answer.
#[derive(Debug, Clone, Error)]
#[error("health check unavailable for '{target}': {reason}")]
pub struct HealthError {
    pub target: String,
    pub reason: String,
}

#[derive(Debug, Clone, Error)]
pub enum RolloutError {
    #[error("timed out after {waited:?} waiting for {condition}")]
    ResourceWaitTimeout { condition: String, waited: Duration },
    #[error("instance '{instance}' is unhealthy: {reason}")]
    Unhealthy { instance: String, reason: String },
    #[error(
        "replica '{host}' not in sync (commit={} last_log={}, leader commit={} last_log={})",
        .replica.commit_index,
        .replica.last_log_index,
        .leader.commit_index,
        .leader.last_log_index
    )]
    NotSynced {
        host: String,
        replica: SyncStatus,
        leader: SyncStatus,
    },
    #[error(transparent)]
    Fleet(FleetError),
    #[error("rollout cancelled")]
    Cancelled,
    #[error("failed to delete '{target}' after {attempts} attempts: {source}")]
    DeleteExhausted {
        target: String,
        attempts: usize,
        #[source]
        source: FleetError,
    },
    #[error("rollback failed ({rollback}) after rollout failure: {original}")]
    RollbackFailed {
        original: Box<RolloutError>,
        rollback: Box<RolloutError>,
    },
}

impl From<FleetError> for RolloutError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::Timeout {
                group,
                capacity,
                waited,
            } => RolloutError::ResourceWaitTimeout {
                condition: format!("group '{}' to reach capacity {}", group, capacity),
                waited,
            },
            other => RolloutError::Fleet(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Rollout(#[from] RolloutError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("unknown region '{0}'")]
    Region(String),
}
