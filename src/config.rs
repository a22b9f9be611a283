use std::{path::Path, time::Duration};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{
    action::DEFAULT_LOCK_TTL, error::ConfigError, rollout::RolloutConfig,
    store::DEFAULT_KEY_PREFIX,
};

const ENV_PREFIX: &str = "FLEETSHIFT";

/// Top-level settings. Every field has a default, so an empty source is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub lock: LockSettings,
    pub action: ActionSettings,
    pub rollout: RolloutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// DynamoDB table backing the coordination store.
    pub table: String,
    pub region: String,
    pub key_prefix: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            table: "fleetshift-coordination".to_string(),
            region: "us-east-1".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Lease ttl for every lock the crate takes, action channel locks included.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub ttl_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_LOCK_TTL.as_secs(),
        }
    }
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionSettings {
    /// Lifetime of a begun action that is never saved or ended.
    pub ttl_secs: u64,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

impl ActionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Settings {
    /// Loads settings from an optional file, then `FLEETSHIFT__*` environment
    /// variables (e.g. `FLEETSHIFT__ROLLOUT__MAX_RETRIES=1`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(path, environment())
    }

    fn load_from(path: Option<&Path>, environment: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder.add_source(environment).build()?.try_deserialize()?;
        Ok(settings)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX).separator("__")
}
