//! One-way network notifications from the IPAM driver.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};
use vnet_types::Template;

/// Receives the outcome of VNET_CREATE / VNET_DELETE notifications.
///
/// These have no waiting caller; the owning network learns the result
/// through this trait.
pub trait NetworkNotifier: Send + Sync {
    /// The driver accepted the network and returned its address ranges.
    fn on_vnet_created(&self, network_id: u32, ranges: Vec<Template>);

    fn on_vnet_create_failed(&self, network_id: u32, reason: &str);

    fn on_vnet_deleted(&self, network_id: u32);

    fn on_vnet_delete_failed(&self, network_id: u32, reason: &str);
}

/// Lifecycle state of a network while the driver works on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    LockCreate,
    Ready,
    LockDelete,
    Done,
    Error,
}

#[derive(Debug, Clone)]
struct TrackedNetwork {
    state: NetworkState,
    ranges: Vec<Template>,
    error: Option<String>,
}

/// A [`NetworkNotifier`] that keeps per-network state in memory.
#[derive(Default)]
pub struct NetworkStateTracker {
    networks: Mutex<HashMap<u32, TrackedNetwork>>,
}

impl NetworkStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a network as waiting for the driver's create reply.
    pub fn begin_create(&self, network_id: u32) {
        self.networks.lock().insert(
            network_id,
            TrackedNetwork {
                state: NetworkState::LockCreate,
                ranges: Vec::new(),
                error: None,
            },
        );
    }

    /// Marks a known network as waiting for the driver's delete reply.
    pub fn begin_delete(&self, network_id: u32) -> bool {
        match self.networks.lock().get_mut(&network_id) {
            Some(net) => {
                net.state = NetworkState::LockDelete;
                true
            }
            None => false,
        }
    }

    pub fn state(&self, network_id: u32) -> Option<NetworkState> {
        self.networks.lock().get(&network_id).map(|n| n.state)
    }

    /// Address ranges the driver returned on create.
    pub fn ranges(&self, network_id: u32) -> Vec<Template> {
        self.networks
            .lock()
            .get(&network_id)
            .map(|n| n.ranges.clone())
            .unwrap_or_default()
    }

    pub fn error(&self, network_id: u32) -> Option<String> {
        self.networks
            .lock()
            .get(&network_id)
            .and_then(|n| n.error.clone())
    }

    fn transition(
        &self,
        network_id: u32,
        expected: NetworkState,
        apply: impl FnOnce(&mut TrackedNetwork),
    ) {
        let mut networks = self.networks.lock();
        match networks.get_mut(&network_id) {
            Some(net) if net.state == expected => apply(net),
            Some(net) => warn!(
                network_id,
                state = ?net.state,
                expected = ?expected,
                "ignoring network notification in unexpected state"
            ),
            None => warn!(network_id, "ignoring notification for unknown network"),
        }
    }
}

impl NetworkNotifier for NetworkStateTracker {
    fn on_vnet_created(&self, network_id: u32, ranges: Vec<Template>) {
        info!(network_id, ranges = ranges.len(), "network created by IPAM driver");
        self.transition(network_id, NetworkState::LockCreate, |net| {
            net.state = NetworkState::Ready;
            net.ranges = ranges;
        });
    }

    fn on_vnet_create_failed(&self, network_id: u32, reason: &str) {
        warn!(network_id, reason, "IPAM driver failed to create network");
        self.transition(network_id, NetworkState::LockCreate, |net| {
            net.state = NetworkState::Error;
            net.error = Some(reason.to_string());
        });
    }

    fn on_vnet_deleted(&self, network_id: u32) {
        info!(network_id, "network deleted by IPAM driver");
        self.transition(network_id, NetworkState::LockDelete, |net| {
            net.state = NetworkState::Done;
        });
    }

    fn on_vnet_delete_failed(&self, network_id: u32, reason: &str) {
        warn!(network_id, reason, "IPAM driver failed to delete network");
        self.transition(network_id, NetworkState::LockDelete, |net| {
            net.state = NetworkState::Error;
            net.error = Some(reason.to_string());
        });
    }
}
