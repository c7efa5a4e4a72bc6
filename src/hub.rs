//! Main Hub struct tying all components together.

use crate::catchup::{CatchUpResolver, DEFAULT_SEND_TIMEOUT, DEFAULT_WORKERS};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{HubError, Result};
use crate::ordering::DeviceLocks;
use crate::store::CommandStore;
use crate::subscriptions::{
    ConnectionHandle, DeviceSelection, Filter, SubscribeRequest, SubscriptionRegistry,
    DEFAULT_SHARDS,
};
use crate::types::{
    Caller, Command, CommandId, CommandInput, CommandPatch, ConnectionId, DeviceId,
    SubscriptionId, Timestamp,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Hub configuration.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Number of subscription registry shards.
    pub registry_shards: usize,

    /// Number of per-device ordering locks.
    pub device_lock_stripes: usize,

    /// Max queued events per connection before deliveries are dropped.
    pub connection_buffer: usize,

    /// Catch-up worker threads.
    pub catch_up_workers: usize,

    /// How long a catch-up replay waits for space on a full connection
    /// queue before giving up with `CatchUpFailed`.
    pub catch_up_send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            registry_shards: DEFAULT_SHARDS,
            device_lock_stripes: 64,
            connection_buffer: 1000,
            catch_up_workers: DEFAULT_WORKERS,
            catch_up_send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Lifecycle of a command inside one insert or update call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandState {
    /// Saved by the store, not yet routed.
    Created,
    /// Routed to every matching subscription (possibly none).
    Dispatched,
}

/// The command hub.
///
/// Provides a unified interface for:
/// - Opening and closing client connections
/// - Subscribing with catch-up and unsubscribing
/// - Inserting and updating commands with live fan-out
/// - Watching updates of a single command
pub struct Hub {
    /// Hub configuration.
    config: HubConfig,

    /// Command storage collaborator.
    store: Arc<dyn CommandStore>,

    /// Subscriptions, bindings and update watches.
    registry: Arc<SubscriptionRegistry>,

    dispatcher: Dispatcher,

    catch_up: CatchUpResolver,

    /// Held across store write and publish so each device's commands are
    /// dispatched in commit order.
    device_locks: Arc<DeviceLocks>,
}

impl Hub {
    /// Create a hub with default configuration.
    pub fn new(store: Arc<dyn CommandStore>) -> Result<Self> {
        Self::with_config(store, HubConfig::default())
    }

    pub fn with_config(store: Arc<dyn CommandStore>, config: HubConfig) -> Result<Self> {
        let registry = Arc::new(SubscriptionRegistry::with_shards(config.registry_shards));
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let device_locks = Arc::new(DeviceLocks::new(config.device_lock_stripes));
        let catch_up = CatchUpResolver::start(
            Arc::clone(&store),
            Arc::clone(&device_locks),
            config.catch_up_workers,
            config.catch_up_send_timeout,
        )?;

        Ok(Self {
            config,
            store,
            registry,
            dispatcher,
            catch_up,
            device_locks,
        })
    }

    // --- Connections ---

    /// Open a connection. Events for it arrive on the returned handle.
    pub fn connect(&self) -> ConnectionHandle {
        self.registry.open_connection(self.config.connection_buffer)
    }

    /// Connection closed by the transport. Idempotent.
    pub fn on_connection_closed(&self, connection: ConnectionId) -> Vec<SubscriptionId> {
        self.registry.remove_all_for_connection(connection)
    }

    // --- Subscriptions ---

    /// Subscribe using raw request parameters.
    pub fn subscribe(
        &self,
        connection: ConnectionId,
        request: SubscribeRequest,
    ) -> Result<SubscriptionId> {
        debug!(
            connection_id = %connection,
            device_id = ?request.device_id,
            device_ids = ?request.device_ids,
            names = ?request.names,
            since = ?request.timestamp,
            "subscribe requested"
        );
        let filter = request.resolve_filter()?;
        self.subscribe_filter(connection, filter, request.timestamp)
    }

    /// Subscribe with an already-resolved filter.
    ///
    /// With `since`, commands strictly after it are replayed in the
    /// background; without it only future commands are delivered.
    pub fn subscribe_filter(
        &self,
        connection: ConnectionId,
        filter: Filter,
        since: Option<Timestamp>,
    ) -> Result<SubscriptionId> {
        let entry = self.registry.add(connection, filter, since.is_some())?;
        let id = entry.id;

        if let Some(since) = since {
            self.catch_up.schedule(entry, since);
        }

        info!(subscription_id = %id, connection_id = %connection, "subscribed");
        Ok(id)
    }

    /// Unsubscribe.
    ///
    /// - id given: remove that subscription if this connection owns it and,
    ///   when `guids` is also given, its devices intersect them.
    /// - only `guids`: remove every subscription whose devices intersect them.
    /// - neither: remove every subscription of the connection.
    pub fn unsubscribe(
        &self,
        connection: ConnectionId,
        subscription_id: Option<SubscriptionId>,
        guids: Option<DeviceSelection>,
    ) -> Result<Vec<SubscriptionId>> {
        if guids.as_ref().is_some_and(DeviceSelection::is_empty) {
            return Err(HubError::InvalidRequest("device guid set is empty".into()));
        }

        let removed = match (subscription_id, guids) {
            (Some(id), guids) => {
                if self.registry.remove_owned(connection, id, guids.as_ref()) {
                    vec![id]
                } else {
                    Vec::new()
                }
            }
            (None, Some(guids)) => self
                .registry
                .remove_by_connection_and_guids(connection, &guids),
            (None, None) => self
                .registry
                .remove_by_connection_and_guids(connection, &DeviceSelection::All),
        };

        debug!(connection_id = %connection, removed = removed.len(), "unsubscribed");
        Ok(removed)
    }

    // --- Commands ---

    /// Insert a command and dispatch it.
    ///
    /// When `connection` is given it also starts watching updates of the new
    /// command.
    pub fn insert_command(
        &self,
        connection: Option<ConnectionId>,
        device_id: &DeviceId,
        input: CommandInput,
        caller: &Caller,
    ) -> Result<Command> {
        if device_id.as_str().is_empty() {
            return Err(HubError::InvalidRequest("device id is required".into()));
        }
        if input.name.is_empty() {
            return Err(HubError::InvalidRequest("command name is required".into()));
        }

        let (command, outcome) = {
            let _ordering = self.device_locks.lock(device_id);
            let command = self.store.insert(device_id, input, caller.user_id)?;
            trace_state(&command, CommandState::Created);
            let outcome = self.dispatcher.publish(&command);
            (command, outcome)
        };
        trace_state(&command, CommandState::Dispatched);
        debug!(command_id = %command.id, delivered = outcome.delivered, "command inserted");

        if let Some(connection) = connection {
            if let Err(e) = self
                .registry
                .watch_updates(connection, command.id, device_id.clone())
            {
                debug!(connection_id = %connection, command_id = %command.id, error = %e, "update watch not registered");
            }
        }

        Ok(command)
    }

    /// Update an existing command and dispatch the new version.
    ///
    /// Without `device_id` the caller's own device is used. An update that
    /// sets a status completes the command: its update watches are released
    /// after this dispatch.
    pub fn update_command(
        &self,
        command_id: CommandId,
        device_id: Option<&DeviceId>,
        patch: &CommandPatch,
        caller: &Caller,
    ) -> Result<Command> {
        let device_id = device_id
            .or(caller.device_id.as_ref())
            .ok_or_else(|| HubError::InvalidRequest("device id is required".into()))?;

        let (updated, outcome) = {
            let _ordering = self.device_locks.lock(device_id);
            let not_found = || HubError::NotFound {
                id: command_id,
                device_id: device_id.clone(),
            };

            self.store
                .find_by_id(command_id, device_id)?
                .ok_or_else(not_found)?;
            let updated = self
                .store
                .update_by_id(command_id, device_id, patch)?
                .ok_or_else(not_found)?;
            let outcome = self.dispatcher.publish_update(&updated);
            if patch.status.is_some() {
                self.registry.release_update_watches(command_id);
            }
            (updated, outcome)
        };
        trace_state(&updated, CommandState::Dispatched);
        debug!(command_id = %command_id, delivered = outcome.delivered, "command updated");

        Ok(updated)
    }

    /// Watch updates of one command on `connection`.
    pub fn watch_command_updates(
        &self,
        connection: ConnectionId,
        command_id: CommandId,
        device_id: &DeviceId,
    ) -> Result<()> {
        self.store
            .find_by_id(command_id, device_id)?
            .ok_or_else(|| HubError::NotFound {
                id: command_id,
                device_id: device_id.clone(),
            })?;
        self.registry
            .watch_updates(connection, command_id, device_id.clone())?;
        Ok(())
    }

    /// Route a command that was stored elsewhere (e.g. by another writer on
    /// the same store).
    pub fn publish(&self, command: &Command) -> DispatchOutcome {
        let _ordering = self.device_locks.lock(&command.device_id);
        self.dispatcher.publish(command)
    }

    // --- Introspection ---

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.subscription_count()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }
}

fn trace_state(command: &Command, state: CommandState) {
    debug!(command_id = %command.id, device_id = %command.device_id, state = ?state, "command state");
}
