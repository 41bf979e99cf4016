//! Delivery of request lines to the IPAM driver process.

use crate::error::{IpamError, IpamResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Outbound half of the driver connection.
///
/// Process supervision, respawning and the pipe itself belong to the
/// driver framework; the bridge only needs to hand over one line at a time.
#[async_trait]
pub trait DriverChannel: Send + Sync {
    async fn send(&self, line: String) -> IpamResult<()>;
}

/// A [`DriverChannel`] backed by an unbounded tokio channel.
///
/// The receiving half is given to whatever writes into the driver
/// process (or, in tests, to a fake plugin).
pub struct ChannelDriver {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelDriver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DriverChannel for ChannelDriver {
    async fn send(&self, line: String) -> IpamResult<()> {
        self.tx
            .send(line)
            .map_err(|_| IpamError::driver("driver channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers_lines() {
        let (driver, mut rx) = ChannelDriver::new();
        driver.send("one".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn test_closed_channel_is_driver_error() {
        let (driver, rx) = ChannelDriver::new();
        drop(rx);
        let err = driver.send("lost".to_string()).await.unwrap_err();
        assert!(matches!(err, IpamError::Driver { .. }));
    }
}
