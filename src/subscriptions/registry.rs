//! Sharded subscription registry.
//!
//! Subscriptions are spread over shards by a CRC32 of their id. Each shard
//! keeps a device index so a publish only looks at candidates for the
//! command's device plus the subscribe-all entries.
//!
//! Lock order is always: connection binding, then shard, then the entry's
//! delivery gate.

use super::binding::{ConnectionHandle, ConnectionTable};
use super::types::{DeviceScope, DeviceSelection, Filter, HubEvent, SubscriptionInfo};
use super::watch::UpdateWatches;
use crate::error::{DeliveryError, HubError, Result};
use crate::types::{Command, CommandId, ConnectionId, DeviceId, SubscriptionId, Timestamp};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default number of registry shards.
pub const DEFAULT_SHARDS: usize = 16;

const RETRY_BACKOFF_MIN: Duration = Duration::from_millis(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(50);

/// Delivery state of one subscription.
enum Gate {
    /// Catch-up pending. Holds ids already delivered by the live path.
    CatchingUp(HashSet<CommandId>),
    Live,
    /// Removed from the registry; nothing more is sent.
    Closed,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    /// Not sent: duplicate during catch-up, or subscription closed.
    Skipped,
    Failed(DeliveryError),
}

/// Internal subscription state.
pub(crate) struct SubscriptionEntry {
    pub id: SubscriptionId,
    pub owner: ConnectionId,
    pub filter: Filter,
    pub created_at: Timestamp,
    outbound: Sender<HubEvent>,
    gate: Mutex<Gate>,
}

impl SubscriptionEntry {
    fn command_event(&self, command: &Command) -> HubEvent {
        HubEvent::Command {
            subscription_id: self.id,
            command: command.clone(),
        }
    }

    /// Send `event` if `admit` accepts the gate, retrying while the queue is
    /// full until `timeout` passes. The gate is checked and the send attempted
    /// under its lock, and released while waiting.
    fn send_patiently<F>(&self, event: HubEvent, timeout: Duration, admit: F) -> Delivery
    where
        F: Fn(&Gate) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut backoff = RETRY_BACKOFF_MIN;
        let mut event = event;
        loop {
            {
                let gate = self.gate.lock();
                if !admit(&*gate) {
                    return Delivery::Skipped;
                }
                match self.outbound.try_send(event) {
                    Ok(()) => return Delivery::Sent,
                    Err(TrySendError::Disconnected(_)) => {
                        return Delivery::Failed(DeliveryError::ConnectionClosed)
                    }
                    Err(TrySendError::Full(rejected)) => event = rejected,
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Delivery::Failed(DeliveryError::ConnectionFull);
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
        }
    }

    /// Deliver from the live dispatch path. Never waits.
    pub fn deliver_live(&self, command: &Command) -> Delivery {
        let mut gate = self.gate.lock();
        match &mut *gate {
            Gate::Closed => return Delivery::Skipped,
            Gate::CatchingUp(seen) => {
                seen.insert(command.id);
            }
            Gate::Live => {}
        }
        match self.outbound.try_send(self.command_event(command)) {
            Ok(()) => Delivery::Sent,
            Err(e) => Delivery::Failed(e.into()),
        }
    }

    /// Deliver a catch-up result unless the live path already did, waiting up
    /// to `timeout` for queue space.
    pub fn deliver_replayed(&self, command: &Command, timeout: Duration) -> Delivery {
        let id = command.id;
        self.send_patiently(self.command_event(command), timeout, |gate| {
            matches!(gate, Gate::CatchingUp(seen) if !seen.contains(&id))
        })
    }

    /// Leave catch-up, drop the live id set and notify the connection,
    /// waiting up to `timeout` for queue space. Returns false if the
    /// subscription is no longer catching up.
    pub fn finish_catch_up(&self, failure: Option<String>, timeout: Duration) -> bool {
        {
            let mut gate = self.gate.lock();
            if !matches!(*gate, Gate::CatchingUp(_)) {
                return false;
            }
            *gate = Gate::Live;
        }

        let event = match failure {
            None => HubEvent::CaughtUp {
                subscription_id: self.id,
            },
            Some(reason) => HubEvent::CatchUpFailed {
                subscription_id: self.id,
                reason,
            },
        };
        let delivery = self.send_patiently(event, timeout, |gate| !matches!(gate, Gate::Closed));
        if let Delivery::Failed(error) = delivery {
            warn!(subscription_id = %self.id, error = %error, "catch-up notice dropped");
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.gate.lock(), Gate::Closed)
    }

    fn close(&self) {
        *self.gate.lock() = Gate::Closed;
    }

    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            owner: self.owner,
            filter: self.filter.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Default)]
struct Shard {
    entries: HashMap<SubscriptionId, Arc<SubscriptionEntry>>,
    by_device: HashMap<DeviceId, HashSet<SubscriptionId>>,
    any_device: HashSet<SubscriptionId>,
}

impl Shard {
    fn insert(&mut self, entry: Arc<SubscriptionEntry>) {
        match entry.filter.scope() {
            DeviceScope::AllPermitted => {
                self.any_device.insert(entry.id);
            }
            DeviceScope::Devices(devices) => {
                for device in devices {
                    self.by_device
                        .entry(device.clone())
                        .or_default()
                        .insert(entry.id);
                }
            }
        }
        self.entries.insert(entry.id, entry);
    }

    fn remove(&mut self, id: &SubscriptionId) -> Option<Arc<SubscriptionEntry>> {
        let entry = self.entries.remove(id)?;
        match entry.filter.scope() {
            DeviceScope::AllPermitted => {
                self.any_device.remove(id);
            }
            DeviceScope::Devices(devices) => {
                for device in devices {
                    if let Some(ids) = self.by_device.get_mut(device) {
                        ids.remove(id);
                        if ids.is_empty() {
                            self.by_device.remove(device);
                        }
                    }
                }
            }
        }
        Some(entry)
    }

    fn candidates<'a>(
        &'a self,
        device_id: &DeviceId,
    ) -> impl Iterator<Item = &'a Arc<SubscriptionEntry>> + 'a {
        self.by_device
            .get(device_id)
            .into_iter()
            .flatten()
            .chain(self.any_device.iter())
            .filter_map(move |id| self.entries.get(id))
    }
}

/// Who wants what: subscriptions, their owning connections and update watches.
pub struct SubscriptionRegistry {
    shards: Vec<RwLock<Shard>>,
    connections: ConnectionTable,
    watches: UpdateWatches,
}

impl SubscriptionRegistry {
    /// Create a new registry.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create a registry with a custom shard count.
    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| RwLock::new(Shard::default()))
                .collect(),
            connections: ConnectionTable::new(),
            watches: UpdateWatches::new(),
        }
    }

    fn shard(&self, id: &SubscriptionId) -> &RwLock<Shard> {
        let index = crc32fast::hash(id.as_bytes()) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Register a new connection.
    pub fn open_connection(&self, buffer_size: usize) -> ConnectionHandle {
        let handle = self.connections.open(buffer_size.max(1));
        debug!(connection_id = %handle.id, "connection opened");
        handle
    }

    // --- Mutation ---

    /// Add a subscription owned by `owner`.
    ///
    /// With `catch_up` the subscription starts in catch-up mode and remembers
    /// live-delivered ids until [`SubscriptionEntry::finish_catch_up`].
    pub(crate) fn add(
        &self,
        owner: ConnectionId,
        filter: Filter,
        catch_up: bool,
    ) -> Result<Arc<SubscriptionEntry>> {
        let binding = self.connections.get(owner).ok_or_else(|| {
            HubError::InvalidRequest(format!("unknown connection {}", owner))
        })?;
        let mut binding = binding.lock();
        if binding.closed {
            return Err(HubError::InvalidRequest(format!(
                "connection {} is closed",
                owner
            )));
        }

        let entry = loop {
            let id = SubscriptionId::generate();
            let mut shard = self.shard(&id).write();
            if shard.entries.contains_key(&id) {
                continue;
            }

            let gate = if catch_up {
                Gate::CatchingUp(HashSet::new())
            } else {
                Gate::Live
            };
            let entry = Arc::new(SubscriptionEntry {
                id,
                owner,
                filter: filter.clone(),
                created_at: Timestamp::now(),
                outbound: binding.outbound.clone(),
                gate: Mutex::new(gate),
            });
            shard.insert(Arc::clone(&entry));
            break entry;
        };

        binding.subscription_ids.insert(entry.id);
        debug!(subscription_id = %entry.id, connection_id = %owner, catch_up, "subscription added");
        Ok(entry)
    }

    /// Remove from the shard and close the gate, under the shard write lock.
    fn detach(&self, id: &SubscriptionId) -> bool {
        let mut shard = self.shard(id).write();
        match shard.remove(id) {
            Some(entry) => {
                entry.close();
                debug!(subscription_id = %id, connection_id = %entry.owner, "subscription removed");
                true
            }
            None => false,
        }
    }

    fn owner_of(&self, id: &SubscriptionId) -> Option<ConnectionId> {
        self.shard(id).read().entries.get(id).map(|e| e.owner)
    }

    fn scope_intersects(&self, id: &SubscriptionId, selection: &DeviceSelection) -> bool {
        self.shard(id)
            .read()
            .entries
            .get(id)
            .map_or(false, |e| e.filter.scope().intersects(selection))
    }

    /// Remove a subscription. Unknown ids are a no-op.
    pub fn remove_by_id(&self, id: SubscriptionId) -> bool {
        let Some(owner) = self.owner_of(&id) else {
            return false;
        };

        match self.connections.get(owner) {
            Some(binding) => {
                let mut binding = binding.lock();
                binding.subscription_ids.remove(&id);
                self.detach(&id)
            }
            // Owner is closing; its cleanup will find nothing left to do.
            None => self.detach(&id),
        }
    }

    /// Remove one subscription only if `owner` owns it and, when a selection is
    /// given, its device scope intersects the selection.
    pub fn remove_owned(
        &self,
        owner: ConnectionId,
        id: SubscriptionId,
        narrowing: Option<&DeviceSelection>,
    ) -> bool {
        let Some(binding) = self.connections.get(owner) else {
            return false;
        };
        let mut binding = binding.lock();
        if !binding.subscription_ids.contains(&id) {
            return false;
        }
        if let Some(selection) = narrowing {
            if !self.scope_intersects(&id, selection) {
                return false;
            }
        }

        binding.subscription_ids.remove(&id);
        self.detach(&id)
    }

    /// Remove every subscription of `owner` whose device scope intersects
    /// `selection`. [`DeviceSelection::All`] removes all of them.
    pub fn remove_by_connection_and_guids(
        &self,
        owner: ConnectionId,
        selection: &DeviceSelection,
    ) -> Vec<SubscriptionId> {
        let Some(binding) = self.connections.get(owner) else {
            return Vec::new();
        };
        let mut binding = binding.lock();

        let selected: Vec<SubscriptionId> = binding
            .subscription_ids
            .iter()
            .filter(|id| self.scope_intersects(id, selection))
            .copied()
            .collect();

        for id in &selected {
            binding.subscription_ids.remove(id);
            self.detach(id);
        }
        selected
    }

    /// Drop a connection and everything it owns. Runs once per connection;
    /// later calls return an empty list.
    pub fn remove_all_for_connection(&self, owner: ConnectionId) -> Vec<SubscriptionId> {
        let Some(binding) = self.connections.take(owner) else {
            return Vec::new();
        };
        let mut binding = binding.lock();
        binding.closed = true;

        let removed: Vec<SubscriptionId> = binding.subscription_ids.drain().collect();
        for id in &removed {
            self.detach(id);
        }
        for command_id in binding.watched_commands.drain() {
            self.watches.remove(command_id, owner);
        }

        info!(connection_id = %binding.connection_id, subscriptions = removed.len(), "connection closed");
        removed
    }

    /// Watch updates of one command on behalf of `owner`.
    pub fn watch_updates(
        &self,
        owner: ConnectionId,
        command_id: CommandId,
        device_id: DeviceId,
    ) -> Result<bool> {
        let binding = self.connections.get(owner).ok_or_else(|| {
            HubError::InvalidRequest(format!("unknown connection {}", owner))
        })?;
        let mut binding = binding.lock();
        if binding.closed {
            return Err(HubError::InvalidRequest(format!(
                "connection {} is closed",
                owner
            )));
        }

        let added = self
            .watches
            .add(command_id, device_id, owner, binding.outbound.clone());
        binding.watched_commands.insert(command_id);
        Ok(added)
    }

    /// Release every update watch on a finished command.
    pub fn release_update_watches(&self, command_id: CommandId) -> usize {
        let released = self.watches.release(command_id);
        for connection_id in &released {
            if let Some(binding) = self.connections.get(*connection_id) {
                binding.lock().watched_commands.remove(&command_id);
            }
        }
        if !released.is_empty() {
            debug!(command_id = %command_id, watchers = released.len(), "update watches released");
        }
        released.len()
    }

    // --- Lookup ---

    /// Ids of every subscription that matches `command` right now.
    pub fn matching(&self, command: &Command) -> Vec<SubscriptionId> {
        let mut ids = Vec::new();
        self.for_each_matching(command, |entry| ids.push(entry.id));
        ids
    }

    /// Call `f` for every matching subscription while its shard read lock is
    /// held, so a concurrent removal either happens before or after `f`.
    pub(crate) fn for_each_matching<F>(&self, command: &Command, mut f: F)
    where
        F: FnMut(&SubscriptionEntry),
    {
        for shard in &self.shards {
            let shard = shard.read();
            for entry in shard.candidates(&command.device_id) {
                if entry.filter.matches(command) {
                    f(entry.as_ref());
                }
            }
        }
    }

    pub(crate) fn for_each_update_watcher<F>(&self, command: &Command, f: F)
    where
        F: FnMut(ConnectionId, &Sender<HubEvent>),
    {
        self.watches
            .for_each_watcher(command.id, &command.device_id, f);
    }

    pub fn get(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.shard(&id).read().entries.get(&id).map(|e| e.info())
    }

    /// Subscription ids bound to a connection.
    pub fn subscriptions_for(&self, owner: ConnectionId) -> Vec<SubscriptionId> {
        self.connections
            .get(owner)
            .map(|b| b.lock().subscription_ids().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, owner: ConnectionId) -> bool {
        self.connections.get(owner).is_some()
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().entries.len()).sum()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn update_watcher_count(&self, command_id: CommandId) -> usize {
        self.watches.watcher_count(command_id)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
