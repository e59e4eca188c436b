use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame size {size} exceeds max {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("message content is empty")]
    EmptyContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "TEXT",
            MessageKind::Image => "IMAGE",
            MessageKind::System => "SYSTEM",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "TEXT" => Ok(MessageKind::Text),
            "IMAGE" => Ok(MessageKind::Image),
            "SYSTEM" => Ok(MessageKind::System),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Logical kind of a fanned-out message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    Chat,
    Presence,
    System,
}

impl BroadcastKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastKind::Chat => "chat",
            BroadcastKind::Presence => "presence",
            BroadcastKind::System => "system",
        }
    }
}

impl fmt::Display for BroadcastKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hub -> client events. Field names are consumed verbatim by the browser client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Message {
        content: String,
        #[serde(rename = "messageType")]
        message_type: MessageKind,
        sender: Participant,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    UserListUpdate {
        users: Vec<Participant>,
    },
    System {
        content: String,
    },
}

impl OutboundEvent {
    pub fn kind(&self) -> BroadcastKind {
        match self {
            OutboundEvent::Message { .. } => BroadcastKind::Chat,
            OutboundEvent::UserListUpdate { .. } => BroadcastKind::Presence,
            OutboundEvent::System { .. } => BroadcastKind::System,
        }
    }

    pub fn presence(users: Vec<Participant>) -> Self {
        OutboundEvent::UserListUpdate { users }
    }

    pub fn system(content: impl Into<String>) -> Self {
        OutboundEvent::System {
            content: content.into(),
        }
    }
}

/// A pre-serialized payload shared by every recipient of one fanout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    kind: BroadcastKind,
    payload: Arc<str>,
}

impl BroadcastMessage {
    pub fn encode(event: &OutboundEvent) -> Result<Self, WireError> {
        let payload =
            serde_json::to_string(event).map_err(|err| WireError::Encode(err.to_string()))?;
        Ok(Self {
            kind: event.kind(),
            payload: Arc::from(payload),
        })
    }

    pub fn kind(&self) -> BroadcastKind {
        self.kind
    }

    pub fn payload(&self) -> &Arc<str> {
        &self.payload
    }
}

/// Client -> hub frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Message {
        content: String,
        #[serde(default, rename = "messageType")]
        message_type: MessageKind,
    },
}

pub fn decode_inbound(frame: &[u8], max_frame_bytes: usize) -> Result<InboundFrame, WireError> {
    if frame.len() > max_frame_bytes {
        return Err(WireError::OversizedFrame {
            size: frame.len(),
            max: max_frame_bytes,
        });
    }
    let parsed: InboundFrame =
        serde_json::from_slice(frame).map_err(|err| WireError::Decode(err.to_string()))?;
    match &parsed {
        InboundFrame::Message { content, .. } if content.trim().is_empty() => {
            Err(WireError::EmptyContent)
        }
        _ => Ok(parsed),
    }
}
