//! # Command Hub
//!
//! In-memory subscription and delivery core for device commands.
//!
//! ## Core Concepts
//!
//! - **Filters**: Device scope plus optional command names
//! - **Registry**: Sharded map of live subscriptions, bound to connections
//! - **Dispatch**: Non-blocking fan-out of inserted and updated commands
//! - **Catch-up**: Background replay since a timestamp, deduplicated against
//!   live delivery
//!
//! ## Example
//!
//! ```ignore
//! use command_hub::{Caller, CommandInput, DeviceId, Hub, MemoryCommandStore, SubscribeRequest};
//!
//! let hub = Hub::new(Arc::new(MemoryCommandStore::new()))?;
//! let conn = hub.connect();
//!
//! // Subscribe to one device, replaying the last minute
//! let id = hub.subscribe(conn.id, SubscribeRequest::device("dev-1").since(minute_ago))?;
//!
//! // Insert a command; the subscriber receives it on its handle
//! hub.insert_command(None, &DeviceId::new("dev-1"), CommandInput::new("reboot"), &Caller::user(1))?;
//! let event = conn.recv()?;
//! ```

pub mod catchup;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod ordering;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use catchup::{CatchUpResolver, CatchUpSummary};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::{DeliveryError, HubError, Result, StoreError};
pub use hub::{CommandState, Hub, HubConfig};
pub use ordering::DeviceLocks;
pub use store::{CommandStore, MemoryCommandStore, StoreResult};
pub use subscriptions::{
    ConnectionHandle, DeviceScope, DeviceSelection, Filter, HubEvent, SubscribeRequest,
    SubscriptionInfo, SubscriptionRegistry, ALL_DEVICES,
};
pub use types::*;
