use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    time::{interval_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    action::{Action, ActionChannel, DEFAULT_LOCK_TTL},
    config::{ActionSettings, Settings},
    error::{ActionError, DeployError, RolloutError},
    rollout::{RolloutController, RolloutPlan, RolloutReport},
    store::Coordination,
    util::signalled,
};

pub const DEPLOY_ACTION: &str = "deploy";

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Runs rollouts so that at most one deploy per service is in flight
/// across every process sharing the coordination store.
///
/// The deploy action is saved every third of its ttl while the rollout runs.
/// If the action is lost to another deploy the rollout is cancelled, which
/// rolls it back.
pub struct Deployer {
    coordination: Coordination,
    controller: Arc<RolloutController>,
    action_ttl: Duration,
    lock_ttl: Duration,
}

impl Deployer {
    pub fn new(coordination: Coordination, controller: Arc<RolloutController>) -> Self {
        Self {
            coordination,
            controller,
            action_ttl: ActionSettings::default().ttl(),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.action_ttl = settings.action.ttl();
        self.lock_ttl = settings.lock.ttl();
        self
    }

    pub fn channel(&self, service: &str) -> ActionChannel {
        ActionChannel::service(service, &self.coordination).with_lock_ttl(self.lock_ttl)
    }

    fn heartbeat(&self) -> Duration {
        (self.action_ttl / 3).max(MIN_HEARTBEAT)
    }

    /// Executes `plan` inside the service's action channel. Fails with
    /// [`ActionError::InProgress`] if another deploy holds it, and with
    /// [`ActionError::Expired`] if the action is lost mid-rollout.
    pub async fn deploy(
        &self,
        service: &str,
        plan: &RolloutPlan,
    ) -> Result<RolloutReport, DeployError> {
        let data = serde_json::to_value(plan).map_err(ActionError::from)?;
        let channel = self.channel(service);

        channel
            .run(DEPLOY_ACTION, self.action_ttl, data, |action| {
                self.supervise(&channel, action, plan)
            })
            .await
    }

    /// Runs the rollout while keeping `action` alive on `channel`.
    async fn supervise(
        &self,
        channel: &ActionChannel,
        mut action: Action,
        plan: &RolloutPlan,
    ) -> Result<RolloutReport, DeployError> {
        info!(
            channel = %channel.name(),
            action = %action.id,
            new_group = %plan.new_group,
            "deploy started"
        );
        let (abort, aborted) = watch::channel(false);
        let mut cancel = self.controller.cancellation();
        let mut cancelled = false;
        let mut lost: Option<ActionError> = None;

        let period = self.heartbeat();
        let mut ticker = interval_at(Instant::now() + period, period);
        let rollout = self.controller.execute_until(plan, aborted);
        tokio::pin!(rollout);

        loop {
            tokio::select! {
                result = &mut rollout => {
                    return match (result, lost) {
                        (Err(RolloutError::Cancelled), Some(err)) => Err(err.into()),
                        (result, _) => result.map_err(DeployError::from),
                    };
                }
                _ = signalled(&mut cancel), if !cancelled => {
                    cancelled = true;
                    let _ = abort.send(true);
                }
                _ = ticker.tick(), if lost.is_none() => match channel.save(&action).await {
                    Ok(saved) => {
                        debug!(
                            channel = %channel.name(),
                            action = %saved.id,
                            "deploy action saved"
                        );
                        action = saved;
                    }
                    Err(err @ ActionError::Expired { .. }) => {
                        warn!(
                            channel = %channel.name(),
                            action = %action.id,
                            "deploy action lost, cancelling rollout"
                        );
                        lost = Some(err);
                        let _ = abort.send(true);
                    }
                    Err(err) => warn!(
                        channel = %channel.name(),
                        action = %action.id,
                        error = %err,
                        "failed to save deploy action"
                    ),
                },
            }
        }
    }
}
