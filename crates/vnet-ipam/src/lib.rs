//! Bridge between address ranges and an out-of-process IPAM plugin.
//!
//! Every call an IPAM-backed range makes (register, unregister, get,
//! allocate, free) becomes a correlated request:
//!
//! 1. [`IpamManager`] registers the call under a fresh id in the
//!    [`PendingRequests`] table and hands a [`DriverRequest`] line to the
//!    [`DriverChannel`]
//! 2. the caller awaits its [`IpamRequest`], which owns a oneshot receiver
//!    and its own deadline
//! 3. the reply-handling task feeds driver output to
//!    [`IpamManager::handle_message`], which resolves exactly the matching
//!    request
//! 4. a request that is never answered fails at its deadline; the periodic
//!    sweep clears any entry whose caller went away
//!
//! Network create/delete notifications are one-way: their replies are
//! routed to a [`NetworkNotifier`] instead of a waiting caller.
//!
//! # Example
//!
//! ```ignore
//! let (driver, driver_rx) = ChannelDriver::new();
//! let manager = Arc::new(IpamManager::new(Arc::new(driver), IpamConfig::default()));
//! manager.spawn_reply_loop(plugin_replies);
//! manager.spawn_sweeper();
//!
//! let reply = manager.get_address(&range_template, 1).await?;
//! ```

mod config;
mod driver;
mod error;
mod manager;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod notify;
mod protocol;
mod request;

pub use config::IpamConfig;
pub use driver::{ChannelDriver, DriverChannel};
pub use error::{IpamError, IpamResult};
pub use manager::{IpamManager, PlainSecrets, SecretDecryptor};
pub use notify::{NetworkNotifier, NetworkState, NetworkStateTracker};
pub use protocol::{DriverReply, DriverRequest, IpamAction, ReplyStatus};
pub use request::{IpamRequest, PendingRequests};
