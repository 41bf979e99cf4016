//! IPAM call orchestration: request registration, reply routing, sweeping.

use crate::config::IpamConfig;
use crate::driver::DriverChannel;
use crate::error::{IpamError, IpamResult};
use crate::notify::NetworkNotifier;
use crate::protocol::{
    parse_template, parse_templates, DriverReply, DriverRequest, IpamAction, ReplyStatus,
};
use crate::request::PendingRequests;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vnet_types::Template;

/// Turns stored attribute values back into clear text for the plugin.
pub trait SecretDecryptor: Send + Sync {
    fn decrypt(&self, attribute: &str, value: &str) -> IpamResult<String>;
}

/// Decryptor for deployments that store secrets in clear text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainSecrets;

impl SecretDecryptor for PlainSecrets {
    fn decrypt(&self, _attribute: &str, value: &str) -> IpamResult<String> {
        Ok(value.to_string())
    }
}

/// Issues IPAM calls and routes driver replies back to their callers.
pub struct IpamManager {
    driver: Arc<dyn DriverChannel>,
    pending: Arc<PendingRequests>,
    config: IpamConfig,
    secrets: Arc<dyn SecretDecryptor>,
    notifier: Option<Arc<dyn NetworkNotifier>>,
}

impl IpamManager {
    pub fn new(driver: Arc<dyn DriverChannel>, config: IpamConfig) -> Self {
        Self {
            driver,
            pending: Arc::new(PendingRequests::new()),
            config,
            secrets: Arc::new(PlainSecrets),
            notifier: None,
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretDecryptor>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NetworkNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &IpamConfig {
        &self.config
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Announces a new range; the plugin may fill in or override its
    /// attributes, and the returned template is what the range should adopt.
    pub async fn register_address_range(&self, range: &Template) -> IpamResult<Template> {
        let action = IpamAction::RegisterAddressRange;
        let info = self.call(action, range, None).await?;
        parse_template(action, &info)
    }

    pub async fn unregister_address_range(&self, range: &Template) -> IpamResult<()> {
        self.call(IpamAction::UnregisterAddressRange, range, None)
            .await
            .map(|_| ())
    }

    /// Asks the plugin to pick `size` consecutive addresses.
    ///
    /// The reply names the first address (`MAC`, `IP` or `IP6`); the caller
    /// is responsible for checking it against the range.
    pub async fn get_address(&self, range: &Template, size: u64) -> IpamResult<Template> {
        let action = IpamAction::GetAddress;
        let address: Template = [("SIZE", size)].into_iter().collect();
        let info = self.call(action, range, Some(address)).await?;
        parse_template(action, &info)
    }

    /// Asks the plugin to confirm a specific address block.
    pub async fn allocate_address(&self, range: &Template, address: Template) -> IpamResult<()> {
        self.call(IpamAction::AllocateAddress, range, Some(address))
            .await
            .map(|_| ())
    }

    pub async fn free_address(&self, range: &Template, address: Template) -> IpamResult<()> {
        self.call(IpamAction::FreeAddress, range, Some(address))
            .await
            .map(|_| ())
    }

    /// Tells the driver a network is being created. The outcome arrives
    /// later through the [`NetworkNotifier`].
    pub async fn notify_vnet_create(&self, network_id: u32, network: &Template) -> IpamResult<()> {
        self.notify(IpamAction::VnetCreate, network_id, network).await
    }

    pub async fn notify_vnet_delete(&self, network_id: u32, network: &Template) -> IpamResult<()> {
        self.notify(IpamAction::VnetDelete, network_id, network).await
    }

    async fn notify(&self, action: IpamAction, network_id: u32, network: &Template) -> IpamResult<()> {
        let line = DriverRequest::new(action, u64::from(network_id))
            .with_network(network.clone())
            .encode()?;
        debug!(action = %action, network_id, "sending network notification");
        self.driver.send(line).await
    }

    async fn call(
        &self,
        action: IpamAction,
        range: &Template,
        address: Option<Template>,
    ) -> IpamResult<String> {
        let range = self.decrypted(range)?;
        let request = self.pending.register(action, self.config.timeout());

        let mut message = DriverRequest::new(action, request.id()).with_address_range(range);
        if let Some(address) = address {
            message = message.with_address(address);
        }
        let line = message.encode()?;

        debug!(action = %action, id = request.id(), "sending IPAM request");
        // A failed send drops the request, which clears its pending entry.
        self.driver.send(line).await?;

        let result = request.wait().await;
        if let Err(e) = &result {
            warn!(action = %action, error = %e, "IPAM request failed");
        }
        result
    }

    fn decrypted(&self, range: &Template) -> IpamResult<Template> {
        let mut copy = range.clone();
        for attribute in &self.config.encrypted_attrs {
            if let Some(value) = range.get(attribute) {
                let clear = self.secrets.decrypt(attribute, value)?;
                copy.set(attribute, clear);
            }
        }
        Ok(copy)
    }

    /// Routes one line of driver output.
    ///
    /// Replies to range calls resolve the matching pending request; anything
    /// else (unknown ids, malformed lines) is reported as an error and has no
    /// effect on other requests.
    pub fn handle_message(&self, line: &str) -> IpamResult<()> {
        let reply = DriverReply::decode(line)?;

        if reply.action.is_one_way() {
            return self.dispatch_notification(reply);
        }

        match self.pending.action_of(reply.id) {
            None => Err(IpamError::UnknownRequest(reply.id)),
            Some(expected) if expected != reply.action => {
                let err = IpamError::protocol(format!(
                    "reply {} answers {} but request was {}",
                    reply.id, reply.action, expected
                ));
                self.pending.resolve(reply.id, Err(err.clone()))?;
                Err(err)
            }
            Some(_) => {
                debug!(action = %reply.action, id = reply.id, status = ?reply.status, "IPAM reply");
                let id = reply.id;
                self.pending.resolve(id, reply.into_result())
            }
        }
    }

    fn dispatch_notification(&self, reply: DriverReply) -> IpamResult<()> {
        let network_id = u32::try_from(reply.id)
            .map_err(|_| IpamError::protocol(format!("network id {} out of range", reply.id)))?;

        let Some(notifier) = &self.notifier else {
            warn!(action = %reply.action, network_id, "no network notifier installed, dropping reply");
            return Ok(());
        };

        match (reply.action, reply.status) {
            (IpamAction::VnetCreate, ReplyStatus::Success) => {
                match parse_templates(reply.action, &reply.info) {
                    Ok(ranges) => notifier.on_vnet_created(network_id, ranges),
                    Err(e) => notifier.on_vnet_create_failed(network_id, &e.to_string()),
                }
            }
            (IpamAction::VnetCreate, ReplyStatus::Failure) => {
                notifier.on_vnet_create_failed(network_id, &reply.info)
            }
            (IpamAction::VnetDelete, ReplyStatus::Success) => notifier.on_vnet_deleted(network_id),
            (IpamAction::VnetDelete, ReplyStatus::Failure) => {
                notifier.on_vnet_delete_failed(network_id, &reply.info)
            }
            (action, _) => {
                return Err(IpamError::protocol(format!("{action} is not a notification")));
            }
        }
        Ok(())
    }

    /// Fails every call whose deadline has passed. Returns how many.
    pub fn sweep_expired(&self) -> usize {
        let expired = self.pending.expire(Instant::now());
        if !expired.is_empty() {
            warn!(count = expired.len(), ids = ?expired, "expired unanswered IPAM requests");
        }
        expired.len()
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) periodically until the
    /// manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep_expired();
            }
        })
    }

    /// Feeds driver output lines to [`handle_message`](Self::handle_message)
    /// until the line source closes.
    pub fn spawn_reply_loop(self: &Arc<Self>, mut lines: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                if let Err(e) = manager.handle_message(&line) {
                    warn!(error = %e, "dropping IPAM driver message");
                }
            }
            info!("IPAM driver output closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ChannelDriver;
    use crate::mock;
    use crate::notify::{NetworkState, NetworkStateTracker};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn range() -> Template {
        [("AR_ID", "0"), ("TYPE", "IP4"), ("IP", "10.0.0.1"), ("SIZE", "10")]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_get_address_round_trip() {
        let manager = mock::connect(IpamConfig::default(), |req| match req.action {
            IpamAction::GetAddress => Some(DriverReply::success(
                req.action,
                req.id,
                r#"{"IP":"10.0.0.4","SIZE":"1"}"#,
            )),
            _ => None,
        });

        let address = manager.get_address(&range(), 1).await.unwrap();
        assert_eq!(address.get("IP"), Some("10.0.0.4"));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_reason_verbatim() {
        let manager = mock::connect(IpamConfig::default(), |req| {
            Some(DriverReply::failure(req.action, req.id, "address 10.0.0.4 is in use"))
        });

        let err = manager
            .allocate_address(&range(), [("IP", "10.0.0.4")].into_iter().collect())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            IpamError::Failure {
                action: IpamAction::AllocateAddress,
                reason: "address 10.0.0.4 is in use".to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_plugin_times_out() {
        let config = IpamConfig {
            timeout_secs: 3,
            ..IpamConfig::default()
        };
        let manager = mock::connect(config, |_| None);

        let err = manager.free_address(&range(), Template::new()).await.unwrap_err();
        assert!(matches!(err, IpamError::Timeout { action: IpamAction::FreeAddress, .. }));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_to_unknown_id_rejected() {
        let (driver, _rx) = ChannelDriver::new();
        let manager = IpamManager::new(Arc::new(driver), IpamConfig::default());
        let line = DriverReply::success(IpamAction::GetAddress, 42, "").encode().unwrap();
        assert_eq!(manager.handle_message(&line), Err(IpamError::UnknownRequest(42)));
        assert!(manager.handle_message("not json").is_err());
    }

    #[tokio::test]
    async fn test_encrypted_attrs_decrypted_for_plugin() {
        struct Rot;
        impl SecretDecryptor for Rot {
            fn decrypt(&self, _attribute: &str, value: &str) -> IpamResult<String> {
                Ok(value.chars().rev().collect())
            }
        }

        let config = IpamConfig {
            encrypted_attrs: vec!["IPAM_TOKEN".to_string()],
            ..IpamConfig::default()
        };
        let (driver, mut rx) = ChannelDriver::new();
        let manager = Arc::new(IpamManager::new(Arc::new(driver), config).with_secrets(Arc::new(Rot)));

        let mut ar = range();
        ar.set("IPAM_TOKEN", "terces");

        let call = {
            let manager = Arc::clone(&manager);
            let ar = ar.clone();
            tokio::spawn(async move { manager.unregister_address_range(&ar).await })
        };

        let line = rx.recv().await.unwrap();
        let request = DriverRequest::decode(&line).unwrap();
        let sent = request.address_range.unwrap();
        assert_eq!(sent.get("IPAM_TOKEN"), Some("secret"));
        // The caller's template is left untouched.
        assert_eq!(ar.get("IPAM_TOKEN"), Some("terces"));

        let reply = DriverReply::success(request.action, request.id, "").encode().unwrap();
        manager.handle_message(&reply).unwrap();
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_network_notifications_reach_notifier() {
        let tracker = Arc::new(NetworkStateTracker::new());
        let (driver, mut rx) = ChannelDriver::new();
        let manager = IpamManager::new(Arc::new(driver), IpamConfig::default())
            .with_notifier(tracker.clone());

        tracker.begin_create(5);
        manager.notify_vnet_create(5, &Template::new()).await.unwrap();
        let request = DriverRequest::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(request.action, IpamAction::VnetCreate);
        assert_eq!(request.id, 5);
        assert_eq!(manager.pending_count(), 0);

        let reply = DriverReply::success(
            IpamAction::VnetCreate,
            5,
            r#"[{"TYPE":"IP4","IP":"10.2.0.1","SIZE":"254"}]"#,
        );
        manager.handle_message(&reply.encode().unwrap()).unwrap();
        assert_eq!(tracker.state(5), Some(NetworkState::Ready));
        assert_eq!(tracker.ranges(5)[0].get("SIZE"), Some("254"));

        tracker.begin_delete(5);
        let reply = DriverReply::failure(IpamAction::VnetDelete, 5, "leases still active");
        manager.handle_message(&reply.encode().unwrap()).unwrap();
        assert_eq!(tracker.state(5), Some(NetworkState::Error));
        assert_eq!(tracker.error(5).as_deref(), Some("leases still active"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_clears_expired_entries() {
        let config = IpamConfig {
            timeout_secs: 2,
            sweep_interval_secs: 1,
            ..IpamConfig::default()
        };
        let (driver, _rx) = ChannelDriver::new();
        let manager = Arc::new(IpamManager::new(Arc::new(driver), config));
        let sweeper = manager.spawn_sweeper();

        let request = manager.pending.register(IpamAction::GetAddress, manager.config.timeout());
        assert_eq!(manager.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(manager.pending_count(), 0);
        assert!(matches!(request.wait().await, Err(IpamError::Timeout { .. })));

        sweeper.abort();
    }

    #[tokio::test]
    async fn test_reply_loop_resolves_calls() {
        let (driver, mut requests) = ChannelDriver::new();
        let manager = Arc::new(IpamManager::new(Arc::new(driver), IpamConfig::default()));
        let (replies, lines) = mpsc::unbounded_channel();
        let reply_loop = manager.spawn_reply_loop(lines);

        let call = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.register_address_range(&range()).await })
        };

        let request = DriverRequest::decode(&requests.recv().await.unwrap()).unwrap();
        // Garbage on the driver output does not disturb the pending call.
        replies.send("garbage".to_string()).unwrap();
        let reply = DriverReply::success(request.action, request.id, r#"{"SIZE":"12"}"#);
        replies.send(reply.encode().unwrap()).unwrap();

        let adopted = call.await.unwrap().unwrap();
        assert_eq!(adopted.get("SIZE"), Some("12"));

        drop(replies);
        reply_loop.await.unwrap();
    }
}
