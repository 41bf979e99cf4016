//! Wire messages exchanged with the IPAM driver process.
//!
//! Each message is one JSON object on its own line. Requests carry the
//! operation code, the correlation id and the structured payload; replies
//! echo the code and id and carry either the effective payload (success) or
//! a human-readable reason (failure) in `info`.

use crate::error::{IpamError, IpamResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use vnet_types::Template;

/// Operation codes understood by IPAM drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpamAction {
    RegisterAddressRange,
    UnregisterAddressRange,
    GetAddress,
    AllocateAddress,
    FreeAddress,
    VnetCreate,
    VnetDelete,
}

impl IpamAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            IpamAction::RegisterAddressRange => "REGISTER_ADDRESS_RANGE",
            IpamAction::UnregisterAddressRange => "UNREGISTER_ADDRESS_RANGE",
            IpamAction::GetAddress => "GET_ADDRESS",
            IpamAction::AllocateAddress => "ALLOCATE_ADDRESS",
            IpamAction::FreeAddress => "FREE_ADDRESS",
            IpamAction::VnetCreate => "VNET_CREATE",
            IpamAction::VnetDelete => "VNET_DELETE",
        }
    }

    /// Returns true for notifications that have no waiting caller.
    pub const fn is_one_way(&self) -> bool {
        matches!(self, IpamAction::VnetCreate | IpamAction::VnetDelete)
    }
}

impl fmt::Display for IpamAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request line sent to the driver.
///
/// For range operations `id` is the pending-request id; for network
/// notifications it is the network id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverRequest {
    pub action: IpamAction,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_range: Option<Template>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Template>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Template>,
}

impl DriverRequest {
    pub fn new(action: IpamAction, id: u64) -> Self {
        Self {
            action,
            id,
            address_range: None,
            address: None,
            network: None,
        }
    }

    pub fn with_address_range(mut self, range: Template) -> Self {
        self.address_range = Some(range);
        self
    }

    pub fn with_address(mut self, address: Template) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_network(mut self, network: Template) -> Self {
        self.network = Some(network);
        self
    }

    /// Serializes the request as a single line.
    pub fn encode(&self) -> IpamResult<String> {
        serde_json::to_string(self).map_err(|e| IpamError::protocol(e.to_string()))
    }

    pub fn decode(line: &str) -> IpamResult<Self> {
        serde_json::from_str(line.trim()).map_err(|e| IpamError::protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyStatus {
    Success,
    Failure,
}

/// A reply line produced by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverReply {
    pub action: IpamAction,
    pub id: u64,
    pub status: ReplyStatus,
    #[serde(default)]
    pub info: String,
}

impl DriverReply {
    pub fn success(action: IpamAction, id: u64, info: impl Into<String>) -> Self {
        Self {
            action,
            id,
            status: ReplyStatus::Success,
            info: info.into(),
        }
    }

    pub fn failure(action: IpamAction, id: u64, reason: impl Into<String>) -> Self {
        Self {
            action,
            id,
            status: ReplyStatus::Failure,
            info: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }

    pub fn encode(&self) -> IpamResult<String> {
        serde_json::to_string(self).map_err(|e| IpamError::protocol(e.to_string()))
    }

    pub fn decode(line: &str) -> IpamResult<Self> {
        serde_json::from_str(line.trim()).map_err(|e| IpamError::protocol(e.to_string()))
    }

    /// Converts the reply into the caller-facing result.
    pub fn into_result(self) -> IpamResult<String> {
        match self.status {
            ReplyStatus::Success => Ok(self.info),
            ReplyStatus::Failure => Err(IpamError::Failure {
                action: self.action,
                reason: self.info,
            }),
        }
    }
}

/// Parses a success payload holding one template. An empty payload is an
/// empty template.
pub(crate) fn parse_template(action: IpamAction, info: &str) -> IpamResult<Template> {
    if info.trim().is_empty() {
        return Ok(Template::new());
    }
    serde_json::from_str(info)
        .map_err(|e| IpamError::protocol(format!("{action} payload is not a template: {e}")))
}

/// Parses a success payload holding a list of templates.
pub(crate) fn parse_templates(action: IpamAction, info: &str) -> IpamResult<Vec<Template>> {
    if info.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(info)
        .map_err(|e| IpamError::protocol(format!("{action} payload is not a template list: {e}")))
}
