//! In-memory command store.
//!
//! Single-process only, nothing survives a restart. Suitable for
//! single-node deployments, development and tests.

use super::{CommandStore, StoreResult};
use crate::subscriptions::DeviceScope;
use crate::types::{Command, CommandId, CommandInput, CommandPatch, DeviceId, Timestamp, UserId};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

/// Command store backed by hash maps.
pub struct MemoryCommandStore {
    /// Counter for generating command IDs.
    next_id: AtomicI64,

    /// Command ID to command.
    commands: RwLock<HashMap<CommandId, Command>>,

    /// Device to its command IDs, in insertion order.
    device_index: RwLock<HashMap<DeviceId, Vec<CommandId>>>,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::starting_at(CommandId(1))
    }

    /// Create a store whose first assigned id is `first`.
    pub fn starting_at(first: CommandId) -> Self {
        Self {
            next_id: AtomicI64::new(first.0),
            commands: RwLock::new(HashMap::new()),
            device_index: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(command: &Command, names: Option<&BTreeSet<String>>, since: Timestamp) -> bool {
        command.timestamp > since && names.map_or(true, |n| n.contains(&command.name))
    }
}

impl Default for MemoryCommandStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandStore for MemoryCommandStore {
    fn insert(
        &self,
        device_id: &DeviceId,
        input: CommandInput,
        user_id: Option<UserId>,
    ) -> StoreResult<Command> {
        let id = CommandId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let command = input.into_command(id, device_id.clone(), user_id);

        // Index lock first so queries never see an id without its command.
        let mut index = self.device_index.write();
        self.commands.write().insert(id, command.clone());
        index.entry(device_id.clone()).or_default().push(id);

        Ok(command)
    }

    fn update_by_id(
        &self,
        id: CommandId,
        device_id: &DeviceId,
        patch: &CommandPatch,
    ) -> StoreResult<Option<Command>> {
        let mut commands = self.commands.write();
        match commands.get_mut(&id) {
            Some(command) if &command.device_id == device_id => {
                patch.apply(command);
                Ok(Some(command.clone()))
            }
            _ => Ok(None),
        }
    }

    fn find_by_id(&self, id: CommandId, device_id: &DeviceId) -> StoreResult<Option<Command>> {
        Ok(self
            .commands
            .read()
            .get(&id)
            .filter(|c| &c.device_id == device_id)
            .cloned())
    }

    fn query_range(
        &self,
        scope: &DeviceScope,
        names: Option<&BTreeSet<String>>,
        since: Timestamp,
    ) -> StoreResult<Vec<Command>> {
        let index = self.device_index.read();
        let commands = self.commands.read();

        let mut found: Vec<Command> = match scope {
            DeviceScope::AllPermitted => commands
                .values()
                .filter(|c| Self::matches(c, names, since))
                .cloned()
                .collect(),
            DeviceScope::Devices(devices) => devices
                .iter()
                .filter_map(|d| index.get(d))
                .flatten()
                .filter_map(|id| commands.get(id))
                .filter(|c| Self::matches(c, names, since))
                .cloned()
                .collect(),
        };

        found.sort_by_key(|c| (c.timestamp, c.id));
        Ok(found)
    }
}
