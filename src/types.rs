//! Core types for the command hub.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifier of a command (assigned by the store).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommandId(pub i64);

impl fmt::Debug for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandId({})", self.0)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device GUID.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

/// Identifier of a physical client connection (assigned by the hub).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque subscription identifier (UUID string on the wire).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Allocate a fresh random id.
    pub fn generate() -> Self {
        SubscriptionId(Uuid::new_v4())
    }

    /// Parse the textual form handed out to clients.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(SubscriptionId)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the user on whose behalf a command was created.
pub type UserId = i64;

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    pub fn plus(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_micros() as i64))
    }

    pub fn minus(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_sub(d.as_micros() as i64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A device command as stored and delivered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Unique identifier (assigned by store).
    pub id: CommandId,

    /// Device the command is addressed to.
    pub device_id: DeviceId,

    /// Command name, e.g. "reboot".
    pub name: String,

    /// Application-defined parameters.
    pub parameters: Option<serde_json::Value>,

    /// When the command was created.
    pub timestamp: Timestamp,

    /// When the command was last updated.
    pub last_updated: Option<Timestamp>,

    /// User that issued the command.
    pub user_id: Option<UserId>,

    /// Seconds the command stays relevant.
    pub lifetime: Option<u32>,

    /// Execution status reported by the device.
    pub status: Option<String>,

    /// Execution result reported by the device.
    pub result: Option<serde_json::Value>,

    /// Whether an update has been applied since insert.
    pub is_updated: bool,
}

/// Input for creating a new command (before id assigned).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommandInput {
    pub name: String,
    pub parameters: Option<serde_json::Value>,
    pub lifetime: Option<u32>,
    pub status: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Explicit timestamp; the store uses the current time when absent.
    pub timestamp: Option<Timestamp>,
}

impl CommandInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Build the stored form once the store has picked an id.
    pub fn into_command(
        self,
        id: CommandId,
        device_id: DeviceId,
        user_id: Option<UserId>,
    ) -> Command {
        Command {
            id,
            device_id,
            name: self.name,
            parameters: self.parameters,
            timestamp: self.timestamp.unwrap_or_else(Timestamp::now),
            last_updated: None,
            user_id,
            lifetime: self.lifetime,
            status: self.status,
            result: self.result,
            is_updated: false,
        }
    }
}

/// Partial update of a command. `None` fields are left untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommandPatch {
    pub name: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub lifetime: Option<u32>,
    pub status: Option<String>,
    pub result: Option<serde_json::Value>,
    pub timestamp: Option<Timestamp>,
}

impl CommandPatch {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.parameters.is_none()
            && self.lifetime.is_none()
            && self.status.is_none()
            && self.result.is_none()
            && self.timestamp.is_none()
    }

    /// Apply in place and mark the command as updated.
    pub fn apply(&self, command: &mut Command) {
        if let Some(ref name) = self.name {
            command.name = name.clone();
        }
        if let Some(ref parameters) = self.parameters {
            command.parameters = Some(parameters.clone());
        }
        if let Some(lifetime) = self.lifetime {
            command.lifetime = Some(lifetime);
        }
        if let Some(ref status) = self.status {
            command.status = Some(status.clone());
        }
        if let Some(ref result) = self.result {
            command.result = Some(result.clone());
        }
        if let Some(timestamp) = self.timestamp {
            command.timestamp = timestamp;
        }
        command.is_updated = true;
        command.last_updated = Some(Timestamp::now());
    }
}

/// Already-authenticated identity issuing a request.
///
/// Either a user (client or admin) or a device acting on its own behalf.
#[derive(Clone, Debug, Default)]
pub struct Caller {
    pub user_id: Option<UserId>,
    pub device_id: Option<DeviceId>,
}

impl Caller {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            device_id: None,
        }
    }

    pub fn device(device_id: impl Into<DeviceId>) -> Self {
        Self {
            user_id: None,
            device_id: Some(device_id.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_command() -> Command {
        CommandInput::new("reboot").into_command(CommandId(1), DeviceId::new("dev-1"), Some(7))
    }

    #[test]
    fn test_patch_apply_marks_updated() {
        let mut command = make_command();
        assert!(!command.is_updated);

        CommandPatch::status("done")
            .with_result(json!({"ok": true}))
            .apply(&mut command);

        assert!(command.is_updated);
        assert!(command.last_updated.is_some());
        assert_eq!(command.status.as_deref(), Some("done"));
        assert_eq!(command.result, Some(json!({"ok": true})));
        assert_eq!(command.name, "reboot");
    }

    #[test]
    fn test_subscription_id_parse() {
        let id = SubscriptionId::generate();
        assert_eq!(SubscriptionId::parse(&id.to_string()), Some(id));
        assert_eq!(SubscriptionId::parse("not-a-uuid"), None);
    }

    #[test]
    fn test_input_keeps_explicit_timestamp() {
        let input = CommandInput::new("ping").with_timestamp(Timestamp(42));
        let command = input.into_command(CommandId(3), DeviceId::new("d"), None);
        assert_eq!(command.timestamp, Timestamp(42));
        assert_eq!(command.user_id, None);
    }

    #[test]
    fn test_empty_patch() {
        assert!(CommandPatch::default().is_empty());
        assert!(!CommandPatch::status("x").is_empty());
    }
}
