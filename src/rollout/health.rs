use tokio::{sync::watch, time::Instant};
use tracing::{debug, info, warn};

use super::{controller::guarded, FleetGroup, GroupRole, Instance, RolloutController, SyncStatus};
use crate::error::{HealthError, RolloutError};

impl RolloutController {
    /// Gates a freshly joined instance: node checks, then load balancer
    /// membership, then for server groups replica sync with the leader.
    pub(super) async fn verify_instance(
        &self,
        group: &FleetGroup,
        instance: &Instance,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), RolloutError> {
        self.await_node_health(group, instance, cancel).await?;

        let load_balancers = guarded(cancel, self.fleet.load_balancers(&group.name)).await??;
        if !load_balancers.is_empty() {
            self.await_load_balancers(&load_balancers, instance, cancel)
                .await?;
        }

        if group.role == GroupRole::Server {
            self.await_replica_sync(&instance.host, cancel).await?;
        }
        info!(group = %group.name, instance = %instance.id, "instance verified");
        Ok(())
    }

    async fn await_node_health(
        &self,
        group: &FleetGroup,
        instance: &Instance,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), RolloutError> {
        let deadline = Instant::now() + self.config.health_timeout();
        loop {
            let check = self.gate.node_healthy(&instance.host, &group.services);
            let reason = match guarded(cancel, check).await? {
                Ok(true) => return Ok(()),
                Ok(false) => "node checks failing".to_string(),
                Err(err) => err.to_string(),
            };
            if Instant::now() >= deadline {
                return Err(RolloutError::Unhealthy {
                    instance: instance.id.clone(),
                    reason,
                });
            }
            debug!(instance = %instance.id, %reason, "waiting for node health");
            guarded(cancel, tokio::time::sleep(self.config.health_poll_interval())).await?;
        }
    }

    async fn await_load_balancers(
        &self,
        names: &[String],
        instance: &Instance,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), RolloutError> {
        let deadline = Instant::now() + self.config.health_timeout();
        loop {
            let check = self.gate.load_balancers_healthy(names, &instance.id);
            let reason = match guarded(cancel, check).await? {
                Ok(true) => return Ok(()),
                Ok(false) => format!("out of service on {}", names.join(",")),
                Err(err) => err.to_string(),
            };
            if Instant::now() >= deadline {
                return Err(RolloutError::Unhealthy {
                    instance: instance.id.clone(),
                    reason,
                });
            }
            debug!(instance = %instance.id, %reason, "waiting for load balancers");
            guarded(cancel, tokio::time::sleep(self.config.health_poll_interval())).await?;
        }
    }

    /// Compares the replica's raft indices with the leader's until it catches
    /// up. An unreadable status is referred to the operator.
    async fn await_replica_sync(
        &self,
        host: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), RolloutError> {
        let mut last = (SyncStatus::default(), SyncStatus::default());
        for attempt in 1..=self.config.sync_attempts {
            let statuses = guarded(cancel, self.read_sync(host)).await?;
            let (replica, leader) = match statuses {
                Ok(statuses) => statuses,
                Err(err) => return self.confirm_unreadable(host, &err, last).await,
            };
            if replica.caught_up_with(&leader) {
                debug!(host, attempt, "replica in sync");
                return Ok(());
            }
            debug!(host, attempt, ?replica, ?leader, "replica behind leader");
            last = (replica, leader);
            if attempt < self.config.sync_attempts {
                guarded(cancel, tokio::time::sleep(self.config.sync_delay())).await?;
            }
        }
        Err(RolloutError::NotSynced {
            host: host.to_string(),
            replica: last.0,
            leader: last.1,
        })
    }

    async fn read_sync(&self, host: &str) -> Result<(SyncStatus, SyncStatus), HealthError> {
        let leader = self.gate.leader_sync_status().await?;
        let replica = self.gate.replica_sync_status(host).await?;
        Ok((replica, leader))
    }

    async fn confirm_unreadable(
        &self,
        host: &str,
        error: &HealthError,
        last: (SyncStatus, SyncStatus),
    ) -> Result<(), RolloutError> {
        warn!(host, error = %error, "replica sync status unavailable");
        if self.decisions.confirm_replica_synced(host, error).await {
            info!(host, "replica sync confirmed by operator");
            return Ok(());
        }
        Err(RolloutError::NotSynced {
            host: host.to_string(),
            replica: last.0,
            leader: last.1,
        })
    }
}
