//! Subscription types: filters, requests and delivered events.

use crate::error::{HubError, Result};
use crate::types::{Command, ConnectionId, DeviceId, SubscriptionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Guid value clients send to mean "every device".
pub const ALL_DEVICES: &str = "all";

/// Which devices a subscription covers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceScope {
    /// Any device the caller is authorized for (already checked upstream).
    AllPermitted,
    /// An explicit, non-empty set of devices.
    Devices(BTreeSet<DeviceId>),
}

impl DeviceScope {
    pub fn contains(&self, device_id: &DeviceId) -> bool {
        match self {
            DeviceScope::AllPermitted => true,
            DeviceScope::Devices(devices) => devices.contains(device_id),
        }
    }

    /// Whether an unsubscribe selection reaches this scope.
    ///
    /// A subscribe-all scope is only reached by the `All` selection.
    pub fn intersects(&self, selection: &DeviceSelection) -> bool {
        match (self, selection) {
            (_, DeviceSelection::All) => true,
            (DeviceScope::AllPermitted, DeviceSelection::Devices(_)) => false,
            (DeviceScope::Devices(mine), DeviceSelection::Devices(theirs)) => {
                !mine.is_disjoint(theirs)
            }
        }
    }
}

/// Immutable description of which commands a subscription wants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Filter {
    scope: DeviceScope,
    names: Option<BTreeSet<String>>,
}

impl Filter {
    /// Validate and build a filter.
    pub fn new(scope: DeviceScope, names: Option<BTreeSet<String>>) -> Result<Self> {
        if let DeviceScope::Devices(ref devices) = scope {
            if devices.is_empty() {
                return Err(HubError::InvalidFilter("device set is empty".into()));
            }
            if devices.iter().any(|d| d.as_str().is_empty()) {
                return Err(HubError::InvalidFilter("device id is empty".into()));
            }
        }
        if let Some(ref names) = names {
            if names.is_empty() {
                return Err(HubError::InvalidFilter("name set is empty".into()));
            }
        }
        Ok(Self { scope, names })
    }

    /// Subscribe to specific devices.
    pub fn devices<I, D>(devices: I) -> Result<Self>
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        Self::new(
            DeviceScope::Devices(devices.into_iter().map(Into::into).collect()),
            None,
        )
    }

    /// Subscribe to every permitted device.
    pub fn all_permitted() -> Self {
        Self {
            scope: DeviceScope::AllPermitted,
            names: None,
        }
    }

    /// Narrow to the given command names.
    pub fn with_names<I, S>(self, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(self.scope, Some(names.into_iter().map(Into::into).collect()))
    }

    pub fn scope(&self) -> &DeviceScope {
        &self.scope
    }

    pub fn names(&self) -> Option<&BTreeSet<String>> {
        self.names.as_ref()
    }

    /// Check if this filter matches a command.
    pub fn matches(&self, command: &Command) -> bool {
        if !self.scope.contains(&command.device_id) {
            return false;
        }

        match self.names {
            Some(ref names) => names.contains(&command.name),
            None => true,
        }
    }
}

/// Device selection for bulk unsubscribe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceSelection {
    /// Every subscription of the connection, regardless of filter.
    All,
    Devices(BTreeSet<DeviceId>),
}

impl DeviceSelection {
    /// Build from raw guids as sent by clients. Any `"all"` guid selects everything.
    pub fn from_guids<I, S>(guids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut devices = BTreeSet::new();
        for guid in guids {
            let guid = guid.into();
            if guid == ALL_DEVICES {
                return DeviceSelection::All;
            }
            if !guid.is_empty() {
                devices.insert(DeviceId(guid));
            }
        }
        DeviceSelection::Devices(devices)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, DeviceSelection::Devices(d) if d.is_empty())
    }
}

/// Raw subscribe parameters, before resolution into a [`Filter`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Single device to subscribe to.
    pub device_id: Option<DeviceId>,
    /// Set of devices to subscribe to.
    pub device_ids: Option<BTreeSet<DeviceId>>,
    /// Command names to receive (None = all names).
    pub names: Option<BTreeSet<String>>,
    /// Replay commands strictly after this time (None = live only).
    pub timestamp: Option<Timestamp>,
}

impl SubscribeRequest {
    pub fn device(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Default::default()
        }
    }

    pub fn devices<I, D>(devices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        Self {
            device_ids: Some(devices.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Resolve the target device set and build the filter.
    ///
    /// Exactly one of `device_id` and `device_ids` must be given.
    pub fn resolve_filter(&self) -> Result<Filter> {
        let devices = match (&self.device_id, &self.device_ids) {
            (Some(_), Some(_)) => {
                return Err(HubError::InvalidRequest(
                    "both device id and device id set given".into(),
                ))
            }
            (None, None) => {
                return Err(HubError::InvalidRequest(
                    "no device id or device id set given".into(),
                ))
            }
            (Some(id), None) => std::iter::once(id.clone()).collect(),
            (None, Some(ids)) => ids
                .iter()
                .filter(|d| !d.as_str().is_empty())
                .cloned()
                .collect(),
        };

        Filter::new(DeviceScope::Devices(devices), self.names.clone())
    }
}

/// Public view of a live subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub owner: ConnectionId,
    pub filter: Filter,
    pub created_at: Timestamp,
}

/// Events delivered to a connection's outbound queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// A matching command was inserted or updated, or replayed by catch-up.
    Command {
        subscription_id: SubscriptionId,
        command: Command,
    },

    /// A watched command was updated.
    CommandUpdate { command: Command },

    /// Historical replay for the subscription finished.
    CaughtUp {
        subscription_id: SubscriptionId,
    },

    /// Historical replay failed. Live delivery continues.
    CatchUpFailed {
        subscription_id: SubscriptionId,
        reason: String,
    },
}

impl HubEvent {
    /// The command carried by this event, if any.
    pub fn command(&self) -> Option<&Command> {
        match self {
            HubEvent::Command { command, .. } | HubEvent::CommandUpdate { command } => {
                Some(command)
            }
            _ => None,
        }
    }
}
