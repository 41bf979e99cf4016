//! IPAM bridge settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for calls to IPAM plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamConfig {
    /// Seconds a caller waits for a plugin reply before the call fails.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Seconds between sweeps of the pending-request table.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Range attributes stored encrypted; they are decrypted in the copy
    /// handed to the plugin.
    #[serde(default)]
    pub encrypted_attrs: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    5
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            encrypted_attrs: Vec::new(),
        }
    }
}

impl IpamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Checks the settings, returning a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_secs == 0 {
            return Err("ipam.timeout_secs must be > 0".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("ipam.sweep_interval_secs must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IpamConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = IpamConfig {
            timeout_secs: 0,
            ..IpamConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
