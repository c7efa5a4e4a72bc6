//! Command storage collaborator.
//!
//! The hub never persists commands itself. It calls a [`CommandStore`] for
//! every insert, update, lookup and catch-up query, and only dispatches
//! after the store call succeeded.

mod memory;

pub use memory::MemoryCommandStore;

use crate::error::StoreError;
use crate::subscriptions::DeviceScope;
use crate::types::{Command, CommandId, CommandInput, CommandPatch, DeviceId, Timestamp, UserId};
use std::collections::BTreeSet;

/// Result type for store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable storage of command records.
///
/// Calls may block. The hub holds no registry locks while calling, only the
/// per-device ordering stripes (see [`DeviceLocks`](crate::ordering::DeviceLocks)).
pub trait CommandStore: Send + Sync {
    /// Persist a new command and return it with its assigned id.
    fn insert(
        &self,
        device_id: &DeviceId,
        input: CommandInput,
        user_id: Option<UserId>,
    ) -> StoreResult<Command>;

    /// Apply `patch` to an existing command. Returns `None` when `(id, device_id)`
    /// does not exist; never creates.
    fn update_by_id(
        &self,
        id: CommandId,
        device_id: &DeviceId,
        patch: &CommandPatch,
    ) -> StoreResult<Option<Command>>;

    /// Look up a command by id, scoped to its device.
    fn find_by_id(&self, id: CommandId, device_id: &DeviceId) -> StoreResult<Option<Command>>;

    /// All commands in `scope` (and with a name in `names`, when given) whose
    /// timestamp is strictly after `since`, oldest first.
    fn query_range(
        &self,
        scope: &DeviceScope,
        names: Option<&BTreeSet<String>>,
        since: Timestamp,
    ) -> StoreResult<Vec<Command>>;
}
