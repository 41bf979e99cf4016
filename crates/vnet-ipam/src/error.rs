//! Error types for IPAM plugin calls.

use crate::protocol::IpamAction;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for IPAM bridge operations.
pub type IpamResult<T> = Result<T, IpamError>;

/// Errors surfaced by the IPAM bridge.
///
/// Plugin-reported failures keep the plugin's reason verbatim so the
/// caller can show it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpamError {
    /// The plugin answered with a failure.
    #[error("{action} failed: {reason}")]
    Failure {
        action: IpamAction,
        reason: String,
    },

    /// No answer arrived before the request deadline.
    #[error("{action} timed out after {}s", timeout.as_secs())]
    Timeout {
        action: IpamAction,
        timeout: Duration,
    },

    /// The pending entry vanished without a result.
    #[error("{action} request {id} was abandoned")]
    Abandoned { action: IpamAction, id: u64 },

    /// The message could not be handed to the driver process.
    #[error("cannot reach IPAM driver: {message}")]
    Driver { message: String },

    /// The driver sent something that is not a valid reply.
    #[error("malformed IPAM driver message: {message}")]
    Protocol { message: String },

    /// A reply referenced an id with no pending request.
    #[error("no pending IPAM request with id {0}")]
    UnknownRequest(u64),

    /// An encrypted attribute could not be decrypted for the plugin.
    #[error("cannot decrypt attribute {attribute}: {message}")]
    Decrypt { attribute: String, message: String },
}

impl IpamError {
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns the action this error belongs to, when known.
    pub fn action(&self) -> Option<IpamAction> {
        match self {
            IpamError::Failure { action, .. }
            | IpamError::Timeout { action, .. }
            | IpamError::Abandoned { action, .. } => Some(*action),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_failure_keeps_reason() {
        let err = IpamError::Failure {
            action: IpamAction::GetAddress,
            reason: "subnet 10.0.0.0/24 exhausted".to_string(),
        };
        assert_eq!(err.to_string(), "GET_ADDRESS failed: subnet 10.0.0.0/24 exhausted");
        assert_eq!(err.action(), Some(IpamAction::GetAddress));
    }

    #[test]
    fn test_timeout_display() {
        let err = IpamError::Timeout {
            action: IpamAction::AllocateAddress,
            timeout: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "ALLOCATE_ADDRESS timed out after 90s");
        assert_eq!(IpamError::driver("pipe closed").action(), None);
    }
}
