//! Coordinated fleet operations: leased locks, single-occupancy action
//! channels on top of a coordination store, and rolling replacement of
//! instance groups.

pub mod action;
pub mod config;
pub mod deploy;
pub mod error;
pub mod lease;
pub mod rollout;
pub mod store;
pub mod telemetry;

mod util;

pub use action::{Action, ActionChannel, ActionObserver, ActionWatcher};
pub use self::config::Settings;
pub use deploy::Deployer;
pub use error::{
    ActionError, ConfigError, DeployError, FleetError, HealthError, LeaseError, LockError,
    RolloutError, StoreError,
};
pub use lease::{Lease, LeaseClient, Lock};
pub use rollout::{
    FailClosed, FailureDecision, FleetGroup, FleetGroupManager, HealthGate, OperatorDecisions,
    RolloutConfig, RolloutController, RolloutPlan, RolloutReport,
};
pub use store::{Coordination, DynamoStore, MemoryStore};
