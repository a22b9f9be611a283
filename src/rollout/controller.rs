use std::{collections::HashSet, future::Future, sync::Arc};

use futures_retry::FutureRetry;
use tokio::{sync::watch, time::Instant};
use tracing::{info, warn};

use super::{
    FailClosed, FailureDecision, FleetGroup, FleetGroupManager, HealthGate, Instance,
    OperatorDecisions, RolloutConfig, RolloutPlan, RolloutReport,
};
use crate::{
    error::{FleetError, RolloutError},
    util::{retry::FixedCountWithDelayStrategy, signalled},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Forward,
    Rollback,
}

/// Why `drive` stopped short of completing a plan.
struct Halt {
    error: RolloutError,
    rollback: bool,
}

impl Halt {
    fn fatal(error: impl Into<RolloutError>) -> Self {
        Self {
            error: error.into(),
            rollback: false,
        }
    }
}

/// Transient bookkeeping for one pass over a plan.
struct RolloutState {
    target: u32,
    /// Capacity most recently requested for the incoming group.
    capacity: u32,
    verified: Vec<String>,
    raised: bool,
    pushed: bool,
    scale_downs: u32,
}

impl RolloutState {
    /// Undoes this iteration's increment so the same step runs again.
    fn retreat(&mut self) {
        if self.raised {
            self.capacity -= 1;
        }
        if self.pushed {
            self.verified.pop();
        }
    }
}

pub struct RolloutController {
    pub(super) fleet: Arc<dyn FleetGroupManager>,
    pub(super) gate: Arc<dyn HealthGate>,
    pub(super) decisions: Arc<dyn OperatorDecisions>,
    pub(super) config: RolloutConfig,
    cancel: watch::Receiver<bool>,
}

impl RolloutController {
    pub fn new(
        fleet: Arc<dyn FleetGroupManager>,
        gate: Arc<dyn HealthGate>,
        config: RolloutConfig,
    ) -> Self {
        Self {
            fleet,
            gate,
            decisions: Arc::new(FailClosed),
            config,
            cancel: never_cancelled(),
        }
    }

    pub fn with_decisions(mut self, decisions: Arc<dyn OperatorDecisions>) -> Self {
        self.decisions = decisions;
        self
    }

    /// Cancels the forward rollout once `cancel` reads true. A cancelled
    /// rollout is rolled back before [`RolloutError::Cancelled`] is returned.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Shifts capacity from `plan.old_group` to `plan.new_group`.
    ///
    /// On a failure the operator chooses to roll back, capacity is moved back
    /// to the old group (restoring its original desired capacity and deleting
    /// the new group) and the original error is returned.
    pub async fn execute(&self, plan: &RolloutPlan) -> Result<RolloutReport, RolloutError> {
        self.execute_until(plan, self.cancel.clone()).await
    }

    /// [`RolloutController::execute`] with a caller-supplied cancellation
    /// signal in place of the one set by `with_cancellation`.
    pub async fn execute_until(
        &self,
        plan: &RolloutPlan,
        cancel: watch::Receiver<bool>,
    ) -> Result<RolloutReport, RolloutError> {
        let old = self.fleet.describe(&plan.old_group).await?;
        let restore_to = old.desired_capacity;
        info!(
            new_group = %plan.new_group,
            old_group = %plan.old_group,
            target = plan.target_size,
            old_capacity = restore_to,
            "starting rollout"
        );

        let halt = match self.drive(plan, Mode::Forward, cancel).await {
            Ok(report) => {
                info!(new_group = %plan.new_group, ?report, "rollout complete");
                return Ok(report);
            }
            Err(halt) => halt,
        };
        if !halt.rollback {
            return Err(halt.error);
        }

        warn!(
            new_group = %plan.new_group,
            old_group = %plan.old_group,
            error = %halt.error,
            "rolling back"
        );
        match self.rollback(&plan.reversed(restore_to)).await {
            Ok(_) => Err(halt.error),
            Err(rollback) => Err(RolloutError::RollbackFailed {
                original: Box::new(halt.error),
                rollback: Box::new(rollback),
            }),
        }
    }

    /// The signal configured with `with_cancellation`.
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }

    /// Runs a plan that undoes a rollout. Shares the stepping logic with
    /// [`RolloutController::execute`] but never starts a further rollback and
    /// ignores cancellation.
    pub async fn rollback(&self, plan: &RolloutPlan) -> Result<RolloutReport, RolloutError> {
        self.drive(plan, Mode::Rollback, never_cancelled())
            .await
            .map_err(|halt| halt.error)
    }

    async fn drive(
        &self,
        plan: &RolloutPlan,
        mode: Mode,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RolloutReport, Halt> {
        let incoming = self
            .fleet
            .describe(&plan.new_group)
            .await
            .map_err(Halt::fatal)?;
        let mut state = RolloutState {
            target: plan.target_size,
            capacity: incoming.desired_capacity,
            verified: Vec::new(),
            raised: false,
            pushed: false,
            scale_downs: 0,
        };
        let mut retries = 0;

        loop {
            match self.iterate(plan, &mut state, &mut cancel).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(error) => match self.on_failure(plan, &error, &mut retries).await {
                    FailureDecision::Retry => {
                        warn!(
                            new_group = %plan.new_group,
                            error = %error,
                            retries,
                            "retrying step"
                        );
                        state.retreat();
                    }
                    FailureDecision::Rollback => {
                        return Err(Halt {
                            error,
                            rollback: mode == Mode::Forward,
                        })
                    }
                },
            }
        }

        self.retire(&plan.old_group).await.map_err(Halt::fatal)?;
        Ok(RolloutReport {
            scale_ups: state.verified.len() as u32,
            scale_downs: state.scale_downs,
            verified: state.verified,
        })
    }

    /// One capacity step. Returns true once the plan is complete.
    async fn iterate(
        &self,
        plan: &RolloutPlan,
        state: &mut RolloutState,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<bool, RolloutError> {
        state.raised = false;
        state.pushed = false;

        let incoming = guarded(cancel, self.fleet.describe(&plan.new_group)).await??;
        let outgoing = guarded(cancel, self.fleet.describe(&plan.old_group)).await??;
        if state.capacity >= state.target && outgoing.instances.is_empty() {
            return Ok(true);
        }

        if state.capacity < state.target {
            let baseline: HashSet<&str> =
                incoming.instances.iter().map(|i| i.id.as_str()).collect();
            state.capacity += 1;
            state.raised = true;
            info!(group = %plan.new_group, capacity = state.capacity, "scaling up");
            let started = Instant::now();
            let resize = self.fleet.resize(&plan.new_group, state.capacity);
            let grown = guarded(cancel, resize).await??;

            let instance = joined_instance(&grown, &baseline, &state.verified).ok_or_else(|| {
                RolloutError::ResourceWaitTimeout {
                    condition: format!(
                        "a new instance in group '{}' at capacity {}",
                        plan.new_group, state.capacity
                    ),
                    waited: started.elapsed(),
                }
            })?;
            state.verified.push(instance.id.clone());
            state.pushed = true;
            self.verify_instance(&grown, &instance, cancel).await?;
        }

        if outgoing.desired_capacity > 0 || !outgoing.instances.is_empty() {
            let capacity = outgoing.desired_capacity.saturating_sub(1);
            info!(group = %plan.old_group, capacity, "scaling down");
            guarded(cancel, self.fleet.resize(&plan.old_group, capacity)).await??;
            if outgoing.desired_capacity > 0 {
                state.scale_downs += 1;
            }
        }
        Ok(false)
    }

    async fn on_failure(
        &self,
        plan: &RolloutPlan,
        error: &RolloutError,
        retries: &mut u32,
    ) -> FailureDecision {
        if matches!(error, RolloutError::Cancelled) {
            return FailureDecision::Rollback;
        }
        if *retries >= self.config.max_retries {
            warn!(new_group = %plan.new_group, retries = *retries, "retry budget exhausted");
            return FailureDecision::Rollback;
        }

        let decision = self.decisions.on_failure(plan, error).await;
        if decision == FailureDecision::Retry {
            *retries += 1;
        }
        decision
    }

    /// Deletes an emptied group and then its launch configuration.
    async fn retire(&self, group: &str) -> Result<(), RolloutError> {
        let retired = self.fleet.describe(group).await?;
        let fleet = &self.fleet;

        self.delete_with_retry(group, move || fleet.delete(group)).await?;
        if let Some(name) = retired.launch_configuration.as_deref() {
            self.delete_with_retry(name, move || fleet.delete_launch_configuration(name))
                .await?;
        }
        info!(group, "retired group");
        Ok(())
    }

    async fn delete_with_retry<F, Fut>(&self, target: &str, delete: F) -> Result<(), RolloutError>
    where
        F: FnMut() -> Fut + Unpin,
        Fut: Future<Output = Result<(), FleetError>>,
    {
        let strategy = FixedCountWithDelayStrategy::new(
            "delete",
            self.config.delete_attempts,
            self.config.delete_delay(),
            |_: &FleetError| true,
        );
        FutureRetry::new(delete, strategy)
            .await
            .map(|_| ())
            .map_err(|(source, attempts)| RolloutError::DeleteExhausted {
                target: target.to_string(),
                attempts,
                source,
            })
    }
}

/// Awaits `fut` unless `cancel` fires first.
pub(super) async fn guarded<T>(
    cancel: &mut watch::Receiver<bool>,
    fut: impl Future<Output = T>,
) -> Result<T, RolloutError> {
    tokio::select! {
        biased;
        _ = signalled(cancel) => Err(RolloutError::Cancelled),
        output = fut => Ok(output),
    }
}

fn never_cancelled() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// The instance a scale-up produced: preferably one absent before the resize,
/// otherwise any instance not yet verified (a retried step finds the same one).
fn joined_instance(
    group: &FleetGroup,
    baseline: &HashSet<&str>,
    verified: &[String],
) -> Option<Instance> {
    let unverified = |instance: &&Instance| !verified.iter().any(|id| *id == instance.id);
    group
        .instances
        .iter()
        .filter(unverified)
        .find(|instance| !baseline.contains(instance.id.as_str()))
        .or_else(|| group.instances.iter().find(unverified))
        .cloned()
}
