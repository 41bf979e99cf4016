//! Configuration file support for address ranges.
//!
//! Loads and validates settings from a TOML file.
//! Default location: /etc/vnet/addrange.toml

use crate::error::{RangeError, RangeResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use vnet_ipam::{IpamConfig, IpamManager};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vnet/addrange.toml";

/// Address range settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConfig {
    /// Upper two MAC octets used when a range does not set `MAC`.
    #[serde(default = "default_mac_prefix")]
    pub mac_prefix: String,

    /// Attributes only privileged callers may change on update.
    #[serde(default = "default_restricted_attrs")]
    pub restricted_attrs: Vec<String>,

    /// Range attributes copied into every lease.
    #[serde(default = "default_inherited_attrs")]
    pub inherited_attrs: Vec<String>,

    #[serde(default)]
    pub ipam: IpamConfig,
}

fn default_mac_prefix() -> String {
    "02:00".to_string()
}

fn default_restricted_attrs() -> Vec<String> {
    ["VN_MAD", "PHYDEV", "VLAN_ID", "BRIDGE"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_inherited_attrs() -> Vec<String> {
    [
        "GATEWAY",
        "GATEWAY6",
        "DNS",
        "NETWORK_ADDRESS",
        "NETWORK_MASK",
        "SEARCH_DOMAIN",
        "MTU",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            mac_prefix: default_mac_prefix(),
            restricted_attrs: default_restricted_attrs(),
            inherited_attrs: default_inherited_attrs(),
            ipam: IpamConfig::default(),
        }
    }
}

impl RangeConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> RangeResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let mut config: RangeConfig = toml::from_str(&content).map_err(|e| {
                    RangeError::config(
                        path.display().to_string(),
                        format!("failed to parse config file: {e}"),
                    )
                })?;
                config.normalize();
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(RangeError::Io(e)),
        }
    }

    pub fn load() -> RangeResult<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    fn normalize(&mut self) {
        for attr in self
            .restricted_attrs
            .iter_mut()
            .chain(self.inherited_attrs.iter_mut())
        {
            *attr = attr.trim().to_ascii_uppercase();
        }
    }

    /// Vendor prefix as the upper 16 bits of a MAC.
    pub fn mac_prefix_value(&self) -> RangeResult<u16> {
        let bad = || RangeError::config("mac_prefix", format!("expected xx:xx, got '{}'", self.mac_prefix));
        let (hi, lo) = self.mac_prefix.trim().split_once(':').ok_or_else(bad)?;
        if hi.is_empty() || hi.len() > 2 || lo.is_empty() || lo.len() > 2 {
            return Err(bad());
        }
        let hi = u8::from_str_radix(hi, 16).map_err(|_| bad())?;
        let lo = u8::from_str_radix(lo, 16).map_err(|_| bad())?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    pub fn is_restricted(&self, attr: &str) -> bool {
        self.restricted_attrs.iter().any(|a| a.eq_ignore_ascii_case(attr))
    }

    pub fn validate(&self) -> RangeResult<()> {
        self.mac_prefix_value()?;
        self.ipam
            .validate()
            .map_err(|message| RangeError::config("ipam", message))?;
        if self.inherited_attrs.iter().any(|a| a.trim().is_empty())
            || self.restricted_attrs.iter().any(|a| a.trim().is_empty())
        {
            return Err(RangeError::config("attrs", "attribute names must not be empty"));
        }
        Ok(())
    }
}

/// Shared construction context for address ranges.
#[derive(Clone)]
pub struct RangeContext {
    config: Arc<RangeConfig>,
    mac_prefix: u16,
    ipam: Option<Arc<IpamManager>>,
}

impl RangeContext {
    pub fn new(mut config: RangeConfig) -> RangeResult<Self> {
        config.normalize();
        config.validate()?;
        let mac_prefix = config.mac_prefix_value()?;
        Ok(Self {
            config: Arc::new(config),
            mac_prefix,
            ipam: None,
        })
    }

    /// Connects IPAM-backed ranges to a driver.
    pub fn with_ipam(mut self, manager: Arc<IpamManager>) -> Self {
        self.ipam = Some(manager);
        self
    }

    pub fn config(&self) -> &RangeConfig {
        &self.config
    }

    pub fn mac_prefix(&self) -> u16 {
        self.mac_prefix
    }

    pub fn ipam(&self) -> Option<&Arc<IpamManager>> {
        self.ipam.as_ref()
    }
}

impl Default for RangeContext {
    fn default() -> Self {
        Self {
            config: Arc::new(RangeConfig::default()),
            mac_prefix: 0x0200,
            ipam: None,
        }
    }
}
