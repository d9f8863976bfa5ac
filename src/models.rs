//! Wire message exchanged with clients and the message type discriminator.

use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Serialized outbound frame. Cloning shares the underlying buffer, so one
/// serialization can be fanned out to any number of connections.
pub type Payload = Utf8Bytes;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Pong,
    JoinGroup,
    LeaveGroup,
    GroupJoined,
    GroupLeft,
    Chat,
    Notification,
    Status,
    StatusUpdated,
    System,
    Error,
    Success,
    /// Any type string the hub does not interpret; relayed as-is.
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::JoinGroup => "join_group",
            MessageType::LeaveGroup => "leave_group",
            MessageType::GroupJoined => "group_joined",
            MessageType::GroupLeft => "group_left",
            MessageType::Chat => "chat",
            MessageType::Notification => "notification",
            MessageType::Status => "status",
            MessageType::StatusUpdated => "status_updated",
            MessageType::System => "system",
            MessageType::Error => "error",
            MessageType::Success => "success",
            MessageType::Other(s) => s,
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        match s {
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "join_group" => MessageType::JoinGroup,
            "leave_group" => MessageType::LeaveGroup,
            "group_joined" => MessageType::GroupJoined,
            "group_left" => MessageType::GroupLeft,
            "chat" => MessageType::Chat,
            "notification" => MessageType::Notification,
            "status" => MessageType::Status,
            "status_updated" => MessageType::StatusUpdated,
            "system" => MessageType::System,
            "error" => MessageType::Error,
            "success" => MessageType::Success,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MessageType::from(s.as_str()))
    }
}

/// `{"type", "data", "timestamp", "from"?, "to"?, "group"?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: Value,
    /// Unix seconds. Zero means "stamp on dispatch".
    #[serde(default, deserialize_with = "crate::serde_compat::lenient_i64")]
    pub timestamp: i64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "crate::serde_compat::empty_as_none"
    )]
    pub from: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "crate::serde_compat::empty_as_none"
    )]
    pub to: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "crate::serde_compat::empty_as_none"
    )]
    pub group: Option<String>,
}

/// Where a dispatched message goes. A direct recipient wins over a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    User(&'a str),
    Group(&'a str),
    Broadcast,
}

impl WsMessage {
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: now_unix(),
            from: None,
            to: None,
            group: None,
        }
    }

    pub fn to_user(mut self, user_id: impl Into<String>) -> Self {
        self.to = Some(user_id.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn to_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn from_user(mut self, user_id: impl Into<String>) -> Self {
        self.from = Some(user_id.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn error(reason: &str) -> Self {
        Self::new(MessageType::Error, Value::String(reason.to_string()))
    }

    pub fn route(&self) -> Route<'_> {
        match (&self.to, &self.group) {
            (Some(to), _) => Route::User(to),
            (None, Some(group)) => Route::Group(group),
            (None, None) => Route::Broadcast,
        }
    }

    pub fn stamp(&mut self) {
        if self.timestamp == 0 {
            self.timestamp = now_unix();
        }
    }

    pub fn encode(&self) -> Result<Payload, serde_json::Error> {
        serde_json::to_string(self).map(Payload::from)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
