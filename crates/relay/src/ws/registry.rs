// Live connection registry: which users are reachable, and through which
// connections.
//
// Entries are sharded by user id (DashMap), so register/deregister on one
// user never contends with another user's traffic. A user key exists only
// while its connection set is non-empty.

use courier_common::{protocol::ws::ServerEvent, types::UserId};
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::join_all;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError},
    Notify,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{config::DEFAULT_SEND_TIMEOUT_MS, metrics};

pub type ConnectionId = Uuid;

/// The registry's view of one live connection: its outbound queue plus a
/// signal used to tell the owning session it has been dropped as dead.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<ServerEvent>,
    evicted: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self { id: Uuid::new_v4(), outbound, evicted: Arc::new(Notify::new()) }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Resolves once a broadcast has given up on this connection.
    pub async fn evicted(&self) {
        self.evicted.notified().await;
    }

    fn evict(&self) {
        self.evicted.notify_one();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    users: DashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    send_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS))
    }
}

impl ConnectionRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self { users: DashMap::new(), send_timeout }
    }

    /// Adds a connection to the user's set. Registering the same connection
    /// twice keeps a single entry.
    pub fn register(&self, user_id: UserId, handle: ConnectionHandle) {
        self.users.entry(user_id).or_default().insert(handle.id, handle);
    }

    /// Removes a connection and prunes the user once the set is empty.
    /// Returns whether the connection was registered.
    pub fn deregister(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let Entry::Occupied(mut entry) = self.users.entry(user_id) else {
            return false;
        };

        let removed = entry.get_mut().remove(&connection_id).is_some();
        if entry.get().is_empty() {
            entry.remove();
        }
        removed
    }

    /// Point-in-time check; a concurrent deregister may follow immediately.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users.contains_key(&user_id)
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.users.get(&user_id).map(|connections| connections.len()).unwrap_or(0)
    }

    pub fn online_users(&self) -> usize {
        self.users.len()
    }

    pub fn total_connections(&self) -> usize {
        self.users.iter().map(|entry| entry.value().len()).sum()
    }

    /// Queue `event` on every live connection of `user_id`.
    ///
    /// Sends run concurrently and each is bounded by the send timeout, so one
    /// stalled connection cannot hold up the others. Connections whose queue
    /// is closed or stays full past the timeout are deregistered and evicted.
    pub async fn broadcast_to_user(&self, user_id: UserId, event: ServerEvent) -> BroadcastOutcome {
        let recipients = match self.users.get(&user_id) {
            Some(connections) => connections.values().cloned().collect::<Vec<_>>(),
            None => return BroadcastOutcome::default(),
        };

        let send_timeout = self.send_timeout;
        let attempts = recipients.iter().map(|handle| {
            let event = event.clone();
            async move { (handle, handle.outbound.send_timeout(event, send_timeout).await) }
        });

        let mut outcome = BroadcastOutcome::default();
        for (handle, result) in join_all(attempts).await {
            match result {
                Ok(()) => outcome.sent += 1,
                Err(error) => {
                    outcome.failed += 1;
                    let reason = match error {
                        SendTimeoutError::Timeout(_) => "timeout",
                        SendTimeoutError::Closed(_) => "closed",
                    };
                    warn!(
                        user_id = %user_id,
                        connection_id = %handle.id,
                        reason,
                        "dropping connection after failed delivery"
                    );
                    self.deregister(user_id, handle.id);
                    handle.evict();
                }
            }
        }

        metrics::add_delivery_failures(outcome.failed);
        debug!(user_id = %user_id, sent = outcome.sent, failed = outcome.failed, "broadcast finished");
        outcome
    }
}
