//! Rolling replacement of one fleet group by another.
//!
//! Capacity moves one instance at a time: grow the new group by one, gate on
//! the new instance's health, shrink the old group by one, repeat. A failed
//! step is retried or rolled back according to [`OperatorDecisions`].
//!
//! The controller assumes nothing else resizes either group while it runs.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, HealthError, RolloutError};

mod controller;
mod health;

pub use controller::RolloutController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Client,
    /// Members are consensus replicas; new ones must catch up with the leader.
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetGroup {
    pub name: String,
    pub desired_capacity: u32,
    pub instances: Vec<Instance>,
    pub role: GroupRole,
    pub load_balancers: Vec<String>,
    /// Services whose node checks gate a new instance.
    pub services: Vec<String>,
    pub launch_configuration: Option<String>,
}

/// Capacity control for named groups of instances.
#[async_trait]
pub trait FleetGroupManager: Send + Sync {
    async fn describe(&self, group: &str) -> Result<FleetGroup, FleetError>;

    /// Sets the desired capacity and returns once the live instance count
    /// matches it.
    async fn resize(&self, group: &str, capacity: u32) -> Result<FleetGroup, FleetError>;

    /// Deletes the group, returning once it is gone.
    async fn delete(&self, group: &str) -> Result<(), FleetError>;

    async fn delete_launch_configuration(&self, name: &str) -> Result<(), FleetError>;

    async fn load_balancers(&self, group: &str) -> Result<Vec<String>, FleetError> {
        Ok(self.describe(group).await?.load_balancers)
    }
}

/// Raft progress of one consensus replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub commit_index: u64,
    pub last_log_index: u64,
}

impl SyncStatus {
    pub fn caught_up_with(&self, leader: &SyncStatus) -> bool {
        self.commit_index >= leader.commit_index && self.last_log_index >= leader.last_log_index
    }
}

#[async_trait]
pub trait HealthGate: Send + Sync {
    async fn node_healthy(&self, host: &str, services: &[String]) -> Result<bool, HealthError>;

    /// Whether `instance` is in service on every named load balancer.
    async fn load_balancers_healthy(
        &self,
        names: &[String],
        instance: &str,
    ) -> Result<bool, HealthError>;

    async fn replica_sync_status(&self, host: &str) -> Result<SyncStatus, HealthError>;

    async fn leader_sync_status(&self) -> Result<SyncStatus, HealthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Re-attempt the failed capacity step.
    Retry,
    /// Undo the rollout and report the failure.
    Rollback,
}

/// Decisions a human operator would otherwise make at a prompt.
#[async_trait]
pub trait OperatorDecisions: Send + Sync {
    async fn on_failure(&self, plan: &RolloutPlan, error: &RolloutError) -> FailureDecision;

    /// Called when a replica's sync state cannot be read. Returning true
    /// accepts the replica as synced.
    async fn confirm_replica_synced(&self, host: &str, error: &HealthError) -> bool;
}

/// Unattended default: always roll back, never vouch for a replica.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailClosed;

#[async_trait]
impl OperatorDecisions for FailClosed {
    async fn on_failure(&self, _plan: &RolloutPlan, _error: &RolloutError) -> FailureDecision {
        FailureDecision::Rollback
    }

    async fn confirm_replica_synced(&self, _host: &str, _error: &HealthError) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPlan {
    pub new_group: String,
    pub old_group: String,
    /// Final capacity of `new_group`. `old_group` always ends at zero.
    pub target_size: u32,
}

impl RolloutPlan {
    pub fn new(
        new_group: impl Into<String>,
        old_group: impl Into<String>,
        target_size: u32,
    ) -> Self {
        Self {
            new_group: new_group.into(),
            old_group: old_group.into(),
            target_size,
        }
    }

    /// The plan that moves capacity back to `old_group`.
    pub fn reversed(&self, restore_to: u32) -> Self {
        Self {
            new_group: self.old_group.clone(),
            old_group: self.new_group.clone(),
            target_size: restore_to,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloutReport {
    pub scale_ups: u32,
    pub scale_downs: u32,
    /// Health-confirmed instance ids, in the order they joined.
    pub verified: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Seconds between health checks on a new instance.
    pub health_poll_interval_secs: u64,
    /// Seconds a new instance has to pass its health checks.
    pub health_timeout_secs: u64,
    /// Sync-state reads before a replica is declared out of sync.
    pub sync_attempts: u32,
    pub sync_delay_secs: u64,
    /// Attempts at deleting the retired group and its launch configuration.
    pub delete_attempts: usize,
    pub delete_delay_secs: u64,
    /// Retries granted per rollout before a failure forces rollback.
    pub max_retries: u32,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            health_poll_interval_secs: 5,
            health_timeout_secs: 300,
            sync_attempts: 12,
            sync_delay_secs: 5,
            delete_attempts: 3,
            delete_delay_secs: 10,
            max_retries: 3,
        }
    }
}

impl RolloutConfig {
    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health_poll_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn sync_delay(&self) -> Duration {
        Duration::from_secs(self.sync_delay_secs)
    }

    pub fn delete_delay(&self) -> Duration {
        Duration::from_secs(self.delete_delay_secs)
    }
}

#[cfg(test)]
pub(crate) mod testing;
