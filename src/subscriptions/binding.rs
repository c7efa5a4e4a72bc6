//! Per-connection ownership of subscriptions and update watches.

use super::types::HubEvent;
use crate::types::{CommandId, ConnectionId, SubscriptionId};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What one physical connection owns.
///
/// Only the registry mutates a binding, always while holding its mutex and
/// before touching any registry shard.
#[derive(Debug)]
pub(crate) struct ConnectionBinding {
    pub connection_id: ConnectionId,
    pub(crate) outbound: Sender<HubEvent>,
    pub(crate) subscription_ids: HashSet<SubscriptionId>,
    pub(crate) watched_commands: HashSet<CommandId>,
    /// Set once on close; a closed binding accepts no new subscriptions.
    pub(crate) closed: bool,
}

impl ConnectionBinding {
    pub fn subscription_ids(&self) -> impl Iterator<Item = &SubscriptionId> {
        self.subscription_ids.iter()
    }
}

/// Handle held by the transport layer for one connection.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Channel to receive events.
    pub receiver: Receiver<HubEvent>,
}

impl ConnectionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<HubEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<HubEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<HubEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Take everything currently queued.
    pub fn drain(&self) -> Vec<HubEvent> {
        self.receiver.try_iter().collect()
    }
}

pub(crate) type SharedBinding = Arc<Mutex<ConnectionBinding>>;

/// All open connections by id.
pub(crate) struct ConnectionTable {
    next_id: AtomicU64,
    bindings: RwLock<HashMap<ConnectionId, SharedBinding>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection with a bounded outbound queue.
    pub fn open(&self, buffer_size: usize) -> ConnectionHandle {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (outbound, receiver) = bounded(buffer_size);

        let binding = ConnectionBinding {
            connection_id: id,
            outbound,
            subscription_ids: HashSet::new(),
            watched_commands: HashSet::new(),
            closed: false,
        };
        self.bindings.write().insert(id, Arc::new(Mutex::new(binding)));

        ConnectionHandle { id, receiver }
    }

    pub fn get(&self, id: ConnectionId) -> Option<SharedBinding> {
        self.bindings.read().get(&id).cloned()
    }

    /// Detach a connection. Only the first caller gets the binding back.
    pub fn take(&self, id: ConnectionId) -> Option<SharedBinding> {
        self.bindings.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }
}
