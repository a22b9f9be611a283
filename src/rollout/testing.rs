//! In-memory collaborators for rollout tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::watch;

use super::{
    FailureDecision, FleetGroup, FleetGroupManager, GroupRole, HealthGate, Instance,
    OperatorDecisions, RolloutPlan, SyncStatus,
};
use crate::error::{FleetError, HealthError, RolloutError};

/// Ordered record of the side effects tests assert on.
pub(crate) type OpLog = Arc<Mutex<Vec<String>>>;

fn record(log: &OpLog, op: String) {
    log.lock().unwrap().push(op);
}

#[derive(Default)]
pub(crate) struct FakeFleet {
    groups: Mutex<HashMap<String, FleetGroup>>,
    launched: Mutex<HashMap<String, u32>>,
    failing_deletes: Mutex<HashMap<String, u32>>,
    cancel_trigger: Mutex<Option<(String, u32, watch::Sender<bool>)>>,
    resize_delay: Mutex<Option<Duration>>,
    stalled: Mutex<HashSet<String>>,
    log: OpLog,
}

impl FakeFleet {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn log(&self) -> OpLog {
        self.log.clone()
    }

    pub(crate) fn operations(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn add_group(&self, name: &str, capacity: u32, role: GroupRole) {
        let mut group = FleetGroup {
            name: name.to_string(),
            desired_capacity: 0,
            instances: Vec::new(),
            role,
            load_balancers: Vec::new(),
            services: vec!["app".to_string()],
            launch_configuration: Some(format!("{}-lc", name)),
        };
        self.scale(&mut group, capacity);
        self.groups.lock().unwrap().insert(name.to_string(), group);
    }

    pub(crate) fn attach_load_balancer(&self, group: &str, name: &str) {
        if let Some(group) = self.groups.lock().unwrap().get_mut(group) {
            group.load_balancers.push(name.to_string());
        }
    }

    /// Desired capacity of `group`, or None once it has been deleted.
    pub(crate) fn capacity(&self, group: &str) -> Option<u32> {
        self.groups
            .lock()
            .unwrap()
            .get(group)
            .map(|group| group.desired_capacity)
    }

    pub(crate) fn fail_deletes(&self, group: &str, times: u32) {
        self.failing_deletes
            .lock()
            .unwrap()
            .insert(group.to_string(), times);
    }

    /// Signals `cancel` when `group` is resized to `capacity`.
    pub(crate) fn cancel_on_resize(&self, group: &str, capacity: u32, cancel: watch::Sender<bool>) {
        *self.cancel_trigger.lock().unwrap() = Some((group.to_string(), capacity, cancel));
    }

    /// Every resize takes `delay` before it is observed.
    pub(crate) fn slow_resizes(&self, delay: Duration) {
        *self.resize_delay.lock().unwrap() = Some(delay);
    }

    /// Resizes of `group` record the capacity but launch no instances.
    pub(crate) fn stall(&self, group: &str) {
        self.stalled.lock().unwrap().insert(group.to_string());
    }

    fn scale(&self, group: &mut FleetGroup, capacity: u32) {
        if self.stalled.lock().unwrap().contains(&group.name) {
            group.instances.truncate(capacity as usize);
            group.desired_capacity = capacity;
            return;
        }
        let mut launched = self.launched.lock().unwrap();
        let counter = launched.entry(group.name.clone()).or_insert(0);
        while (group.instances.len() as u32) < capacity {
            *counter += 1;
            let id = format!("{}-{}", group.name, counter);
            group.instances.push(Instance {
                host: format!("{}.internal", id),
                id,
            });
        }
        group.instances.truncate(capacity as usize);
        group.desired_capacity = capacity;
    }
}

#[async_trait]
impl FleetGroupManager for FakeFleet {
    async fn describe(&self, group: &str) -> Result<FleetGroup, FleetError> {
        self.groups
            .lock()
            .unwrap()
            .get(group)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(group.to_string()))
    }

    async fn resize(&self, group: &str, capacity: u32) -> Result<FleetGroup, FleetError> {
        record(&self.log, format!("resize {} {}", group, capacity));
        let delay = *self.resize_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let resized = {
            let mut groups = self.groups.lock().unwrap();
            let entry = groups
                .get_mut(group)
                .ok_or_else(|| FleetError::NotFound(group.to_string()))?;
            self.scale(entry, capacity);
            entry.clone()
        };

        if let Some((target, at, cancel)) = self.cancel_trigger.lock().unwrap().as_ref() {
            if target == group && *at == capacity {
                let _ = cancel.send(true);
            }
        }
        Ok(resized)
    }

    async fn delete(&self, group: &str) -> Result<(), FleetError> {
        record(&self.log, format!("delete {}", group));
        if let Some(remaining) = self.failing_deletes.lock().unwrap().get_mut(group) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FleetError::Provider("resource in use".to_string()));
            }
        }
        self.groups
            .lock()
            .unwrap()
            .remove(group)
            .map(|_| ())
            .ok_or_else(|| FleetError::NotFound(group.to_string()))
    }

    async fn delete_launch_configuration(&self, name: &str) -> Result<(), FleetError> {
        record(&self.log, format!("delete-launch-configuration {}", name));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeGate {
    log: OpLog,
    unhealthy: Mutex<HashSet<String>>,
    out_of_service: Mutex<HashSet<String>>,
    leader: Mutex<Option<SyncStatus>>,
    progress: Mutex<HashMap<String, VecDeque<SyncStatus>>>,
}

impl FakeGate {
    pub(crate) fn new(log: OpLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            ..Default::default()
        })
    }

    pub(crate) fn mark_unhealthy(&self, host: &str) {
        self.unhealthy.lock().unwrap().insert(host.to_string());
    }

    pub(crate) fn mark_healthy(&self, host: &str) {
        self.unhealthy.lock().unwrap().remove(host);
    }

    pub(crate) fn mark_out_of_service(&self, instance: &str) {
        self.out_of_service
            .lock()
            .unwrap()
            .insert(instance.to_string());
    }

    pub(crate) fn set_leader(&self, commit_index: u64, last_log_index: u64) {
        *self.leader.lock().unwrap() = Some(SyncStatus {
            commit_index,
            last_log_index,
        });
    }

    /// Successive sync reads for `host`. The last entry repeats.
    pub(crate) fn set_replica_progress(&self, host: &str, progress: Vec<(u64, u64)>) {
        let statuses = progress
            .into_iter()
            .map(|(commit_index, last_log_index)| SyncStatus {
                commit_index,
                last_log_index,
            })
            .collect();
        self.progress
            .lock()
            .unwrap()
            .insert(host.to_string(), statuses);
    }
}

#[async_trait]
impl HealthGate for FakeGate {
    async fn node_healthy(&self, host: &str, _services: &[String]) -> Result<bool, HealthError> {
        record(&self.log, format!("health {}", host));
        Ok(!self.unhealthy.lock().unwrap().contains(host))
    }

    async fn load_balancers_healthy(
        &self,
        _names: &[String],
        instance: &str,
    ) -> Result<bool, HealthError> {
        record(&self.log, format!("lb {}", instance));
        Ok(!self.out_of_service.lock().unwrap().contains(instance))
    }

    async fn replica_sync_status(&self, host: &str) -> Result<SyncStatus, HealthError> {
        let mut progress = self.progress.lock().unwrap();
        let statuses = progress.get_mut(host).ok_or_else(|| HealthError {
            target: host.to_string(),
            reason: "connection refused".to_string(),
        })?;
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().copied()
        };
        status.ok_or_else(|| HealthError {
            target: host.to_string(),
            reason: "no raft stats".to_string(),
        })
    }

    async fn leader_sync_status(&self) -> Result<SyncStatus, HealthError> {
        self.leader.lock().unwrap().ok_or_else(|| HealthError {
            target: "leader".to_string(),
            reason: "no leader elected".to_string(),
        })
    }
}

/// Replays a fixed list of failure decisions, then rolls back.
#[derive(Default)]
pub(crate) struct ScriptedDecisions {
    script: Mutex<VecDeque<FailureDecision>>,
    calls: AtomicUsize,
    confirm_replicas: AtomicBool,
    hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl ScriptedDecisions {
    pub(crate) fn new(script: Vec<FailureDecision>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub(crate) fn confirming_replicas(self: Arc<Self>) -> Arc<Self> {
        self.confirm_replicas.store(true, Ordering::SeqCst);
        self
    }

    /// Runs `hook` every time a failure decision is requested.
    pub(crate) fn on_decide(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperatorDecisions for ScriptedDecisions {
    async fn on_failure(&self, _plan: &RolloutPlan, _error: &RolloutError) -> FailureDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook();
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FailureDecision::Rollback)
    }

    async fn confirm_replica_synced(&self, _host: &str, _error: &HealthError) -> bool {
        self.confirm_replicas.load(Ordering::SeqCst)
    }
}
