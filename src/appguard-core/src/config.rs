//! Configuration for the enforcement layer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GuardError;

/// How a HARD violation is answered.
///
/// Chosen once at composition time and applied uniformly by every path
/// that can lock the installation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStrategy {
    /// Persist the lock and keep the process alive in the locked experience.
    #[default]
    Lock,
    /// Persist the lock, then terminate the process.
    Terminate,
}

/// Configuration for AppGuard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Directory holding the persisted lock record. `None` keeps state in memory.
    pub state_dir: Option<PathBuf>,
    /// Tamper monitor tick interval.
    #[serde(with = "duration_secs")]
    pub monitor_interval: Duration,
    /// Maximum age of the last full verification before secrets are re-gated.
    #[serde(with = "duration_millis")]
    pub revalidation_ttl: Duration,
    /// Time budget for hashing the installed bundle.
    #[serde(with = "duration_secs")]
    pub checksum_timeout: Duration,
    /// Consecutive checksum timeouts tolerated before escalating to HARD.
    pub max_checksum_timeouts: u32,
    /// Response to HARD violations.
    pub response: ResponseStrategy,
    /// Path of the native attestation module. `None` runs without it.
    pub native_module_path: Option<PathBuf>,
    /// Installation identifier, binds the lock record and unlock grants.
    pub installation_id: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            monitor_interval: Duration::from_secs(10),
            revalidation_ttl: Duration::from_secs(5),
            checksum_timeout: Duration::from_secs(30),
            max_checksum_timeouts: 3,
            response: ResponseStrategy::Lock,
            native_module_path: None,
            installation_id: "default".into(),
        }
    }
}

impl GuardConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, GuardError> {
        let data = std::fs::read_to_string(path).map_err(|e| GuardError::Config {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| GuardError::Config {
            message: format!("cannot parse {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable enforcement.
    pub fn validate(&self) -> Result<(), GuardError> {
        if self.monitor_interval.is_zero() {
            return Err(GuardError::Config {
                message: "monitor_interval must be non-zero".into(),
            });
        }
        if self.checksum_timeout.is_zero() {
            return Err(GuardError::Config {
                message: "checksum_timeout must be non-zero".into(),
            });
        }
        if self.installation_id.trim().is_empty() {
            return Err(GuardError::Config {
                message: "installation_id must not be empty".into(),
            });
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
