//! Pending-request table and the caller-side request handle.

use crate::error::{IpamError, IpamResult};
use crate::protocol::IpamAction;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

struct PendingEntry {
    action: IpamAction,
    deadline: Instant,
    timeout: Duration,
    reply: oneshot::Sender<IpamResult<String>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: HashMap<u64, PendingEntry>,
}

/// Table of requests sent to the driver and not yet answered.
///
/// Each entry is resolved at most once: by a reply, by [`expire`], or by
/// its caller dropping the [`IpamRequest`].
///
/// [`expire`]: PendingRequests::expire
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<Inner>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new request under a fresh id.
    pub fn register(self: &Arc<Self>, action: IpamAction, timeout: Duration) -> IpamRequest {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;

        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.insert(
            id,
            PendingEntry {
                action,
                deadline,
                timeout,
                reply: tx,
            },
        );

        IpamRequest {
            id,
            action,
            deadline,
            timeout,
            receiver: rx,
            table: Arc::clone(self),
        }
    }

    /// Returns the action of a pending request.
    pub fn action_of(&self, id: u64) -> Option<IpamAction> {
        self.inner.lock().entries.get(&id).map(|e| e.action)
    }

    /// Delivers `result` to the caller waiting on `id`.
    pub fn resolve(&self, id: u64, result: IpamResult<String>) -> IpamResult<()> {
        let entry = self
            .inner
            .lock()
            .entries
            .remove(&id)
            .ok_or(IpamError::UnknownRequest(id))?;
        // The caller may already have given up; nothing to deliver then.
        let _ = entry.reply.send(result);
        Ok(())
    }

    /// Fails every request whose deadline is at or before `now`.
    ///
    /// Returns the ids that were expired.
    pub fn expire(&self, now: Instant) -> Vec<u64> {
        let expired: Vec<(u64, PendingEntry)> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u64> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.entries.remove(&id).map(|e| (id, e)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(id, entry)| {
                let _ = entry.reply.send(Err(IpamError::Timeout {
                    action: entry.action,
                    timeout: entry.timeout,
                }));
                id
            })
            .collect()
    }

    /// Drops a pending entry without resolving it.
    pub fn cancel(&self, id: u64) -> bool {
        self.inner.lock().entries.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

/// Caller-side handle for one outstanding IPAM call.
///
/// Awaiting [`wait`](IpamRequest::wait) yields the reply payload, the
/// plugin's failure, or a timeout once the request's own deadline passes.
/// Dropping the handle removes its pending entry.
pub struct IpamRequest {
    id: u64,
    action: IpamAction,
    deadline: Instant,
    timeout: Duration,
    receiver: oneshot::Receiver<IpamResult<String>>,
    table: Arc<PendingRequests>,
}

impl IpamRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn action(&self) -> IpamAction {
        self.action
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn wait(mut self) -> IpamResult<String> {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(IpamError::Abandoned {
                action: self.action,
                id: self.id,
            }),
            Err(_) => Err(IpamError::Timeout {
                action: self.action,
                timeout: self.timeout,
            }),
        }
    }
}

impl Drop for IpamRequest {
    fn drop(&mut self) {
        self.table.cancel(self.id);
    }
}
