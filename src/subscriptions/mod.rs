//! Subscription system for live command delivery.
//!
//! This module keeps track of who wants which commands:
//! - Filters over device ids and command names
//! - A sharded registry of live subscriptions
//! - Per-connection bindings used for unsubscribe and disconnect cleanup
//! - Narrow update watches keyed by command id
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new();
//! let conn = registry.open_connection(256);
//!
//! let filter = Filter::devices(["dev-1"])?.with_names(["reboot"])?;
//! let ids = registry.matching(&command);
//!
//! loop {
//!     match conn.recv() {
//!         Ok(HubEvent::Command { subscription_id, command }) => println!("{subscription_id}: {command:?}"),
//!         Ok(HubEvent::CaughtUp { .. }) => println!("Now live!"),
//!         Ok(_) => {}
//!         Err(_) => break,
//!     }
//! }
//! ```

mod binding;
mod registry;
mod types;
mod watch;

pub use binding::ConnectionHandle;
pub(crate) use registry::{Delivery, SubscriptionEntry};
pub use registry::{SubscriptionRegistry, DEFAULT_SHARDS};
pub use types::{
    DeviceScope, DeviceSelection, Filter, HubEvent, SubscribeRequest, SubscriptionInfo,
    ALL_DEVICES,
};
