//! In-process stand-in for an IPAM driver.
//!
//! A handler closure plays the plugin: it sees every decoded request and
//! returns the reply to deliver, or `None` to stay silent like a hung
//! driver.

use crate::config::IpamConfig;
use crate::driver::ChannelDriver;
use crate::manager::IpamManager;
use crate::protocol::{DriverReply, DriverRequest};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Answers requests read from `requests` by calling `handler`.
pub fn spawn_plugin<F>(
    manager: Weak<IpamManager>,
    mut requests: mpsc::UnboundedReceiver<String>,
    mut handler: F,
) -> JoinHandle<()>
where
    F: FnMut(DriverRequest) -> Option<DriverReply> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(line) = requests.recv().await {
            let Ok(request) = DriverRequest::decode(&line) else {
                continue;
            };
            let Some(reply) = handler(request) else {
                continue;
            };
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if let Ok(line) = reply.encode() {
                if let Err(e) = manager.handle_message(&line) {
                    debug!(error = %e, "mock plugin reply rejected");
                }
            }
        }
    })
}

/// Builds a manager wired to a fake plugin driven by `handler`.
pub fn connect<F>(config: IpamConfig, handler: F) -> Arc<IpamManager>
where
    F: FnMut(DriverRequest) -> Option<DriverReply> + Send + 'static,
{
    let (driver, requests) = ChannelDriver::new();
    let manager = Arc::new(IpamManager::new(Arc::new(driver), config));
    spawn_plugin(Arc::downgrade(&manager), requests, handler);
    manager
}
