//! The engine configuration as read from the server's toml configuration. These are
//! operational tuning parameters, and are "per server" - they are never replicated.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::prelude::*;

fn default_max_clean_tasks() -> usize {
    DEFAULT_MAX_CLEAN_TASKS
}

fn default_max_abort_tasks() -> usize {
    DEFAULT_MAX_ABORT_TASKS
}

fn default_backoff_initial_ms() -> u64 {
    DEFAULT_BACKOFF_INITIAL_MS
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

fn default_send_timeout_ms() -> u64 {
    DEFAULT_SEND_TIMEOUT_MS
}

fn default_force_quorum_percent() -> u8 {
    DEFAULT_FORCE_QUORUM_PERCENT
}

fn default_abort_intent_ttl_secs() -> u64 {
    DEFAULT_ABORT_INTENT_TTL_SECS
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CleanAllRuvConfig {
    /// Maximum number of clean tasks (originated and participating) tracked at once.
    #[serde(default = "default_max_clean_tasks")]
    pub max_clean_tasks: usize,
    /// Maximum number of abort tasks running at once.
    #[serde(default = "default_max_abort_tasks")]
    pub max_abort_tasks: usize,
    /// First delay before retrying an unresponsive member.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Ceiling of the exponential retry delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// How long to wait for a member to reply to a single message.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Percentage of known-reachable members that must respond before a forced
    /// clean leaves the collecting phase.
    #[serde(default = "default_force_quorum_percent")]
    pub force_quorum_percent: u8,
    /// How long an abort intent is retained once no abort task holds it.
    #[serde(default = "default_abort_intent_ttl_secs")]
    pub abort_intent_ttl_secs: u64,
    /// File path of the state database. If unset, state is held in memory only.
    pub db_path: Option<String>,
}

impl Default for CleanAllRuvConfig {
    fn default() -> Self {
        CleanAllRuvConfig {
            max_clean_tasks: DEFAULT_MAX_CLEAN_TASKS,
            max_abort_tasks: DEFAULT_MAX_ABORT_TASKS,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            force_quorum_percent: DEFAULT_FORCE_QUORUM_PERCENT,
            abort_intent_ttl_secs: DEFAULT_ABORT_INTENT_TTL_SECS,
            db_path: None,
        }
    }
}

impl CleanAllRuvConfig {
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, OperationError> {
        let mut f = File::open(config_path.as_ref()).map_err(|e| {
            admin_error!(?e, path = ?config_path.as_ref(), "Unable to open config file");
            OperationError::FsError
        })?;

        let mut contents = String::new();
        f.read_to_string(&mut contents).map_err(|e| {
            admin_error!(?e, "unable to read config contents");
            OperationError::FsError
        })?;

        Self::from_toml_str(contents.as_str())
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, OperationError> {
        let config: CleanAllRuvConfig = toml::from_str(contents).map_err(|e| {
            admin_error!(?e, "unable to parse config");
            OperationError::InvalidConfig(e.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// A configuration with short retry windows, so that tests observe convergence quickly.
    pub fn new_for_test() -> Self {
        CleanAllRuvConfig {
            backoff_initial_ms: 10,
            backoff_max_ms: 80,
            send_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), OperationError> {
        if self.max_clean_tasks == 0 {
            return Err(OperationError::InvalidConfig(
                "max_clean_tasks must be greater than 0".to_string(),
            ));
        }
        if self.max_abort_tasks == 0 {
            return Err(OperationError::InvalidConfig(
                "max_abort_tasks must be greater than 0".to_string(),
            ));
        }
        if self.backoff_initial_ms == 0 {
            return Err(OperationError::InvalidConfig(
                "backoff_initial_ms must be greater than 0".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(OperationError::InvalidConfig(
                "backoff_max_ms must not be less than backoff_initial_ms".to_string(),
            ));
        }
        if !(1..=100).contains(&self.force_quorum_percent) {
            return Err(OperationError::InvalidConfig(
                "force_quorum_percent must be within 1 to 100".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn abort_intent_ttl(&self) -> Duration {
        Duration::from_secs(self.abort_intent_ttl_secs)
    }

    /// How many of `known_reachable` members must respond before a forced clean proceeds.
    pub fn force_quorum(&self, known_reachable: usize) -> usize {
        let pct = self.force_quorum_percent as usize;
        (known_reachable * pct).div_ceil(100)
    }
}
