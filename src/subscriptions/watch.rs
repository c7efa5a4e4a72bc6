//! Narrow per-command update watches.

use super::types::HubEvent;
use crate::types::{CommandId, ConnectionId, DeviceId};
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use std::collections::HashMap;

/// One connection waiting for updates of one command.
struct UpdateWatch {
    connection_id: ConnectionId,
    device_id: DeviceId,
    outbound: Sender<HubEvent>,
}

/// Command id to the connections watching it.
pub(crate) struct UpdateWatches {
    watches: RwLock<HashMap<CommandId, Vec<UpdateWatch>>>,
}

impl UpdateWatches {
    pub fn new() -> Self {
        Self {
            watches: RwLock::new(HashMap::new()),
        }
    }

    /// Add a watch. A connection watches a given command at most once.
    pub fn add(
        &self,
        command_id: CommandId,
        device_id: DeviceId,
        connection_id: ConnectionId,
        outbound: Sender<HubEvent>,
    ) -> bool {
        let mut watches = self.watches.write();
        let entry = watches.entry(command_id).or_default();
        if entry.iter().any(|w| w.connection_id == connection_id) {
            return false;
        }
        entry.push(UpdateWatch {
            connection_id,
            device_id,
            outbound,
        });
        true
    }

    pub fn remove(&self, command_id: CommandId, connection_id: ConnectionId) {
        let mut watches = self.watches.write();
        if let Some(entry) = watches.get_mut(&command_id) {
            entry.retain(|w| w.connection_id != connection_id);
            if entry.is_empty() {
                watches.remove(&command_id);
            }
        }
    }

    /// Drop every watch on `command_id`. Returns the connections that held one.
    pub fn release(&self, command_id: CommandId) -> Vec<ConnectionId> {
        self.watches
            .write()
            .remove(&command_id)
            .map(|entry| entry.into_iter().map(|w| w.connection_id).collect())
            .unwrap_or_default()
    }

    /// Call `f` with the outbound queue of every watcher of this command on
    /// this device.
    pub fn for_each_watcher<F>(&self, command_id: CommandId, device_id: &DeviceId, mut f: F)
    where
        F: FnMut(ConnectionId, &Sender<HubEvent>),
    {
        let watches = self.watches.read();
        if let Some(entry) = watches.get(&command_id) {
            for watch in entry.iter().filter(|w| &w.device_id == device_id) {
                f(watch.connection_id, &watch.outbound);
            }
        }
    }

    pub fn watcher_count(&self, command_id: CommandId) -> usize {
        self.watches
            .read()
            .get(&command_id)
            .map(|w| w.len())
            .unwrap_or(0)
    }
}
