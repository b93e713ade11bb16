//! Relay WebSocket protocol definitions.
//!
//! All communication uses JSON frames over WebSocket. Every frame carries an
//! `op` discriminator:
//!
//! - client → server: `sub`, `ack`, `send`, `resync`, `ping`
//! - server → client: `ready`, `resync`, `batch`, `pong`, `error`

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PAYLOAD_BYTES: usize = 262_144; // 256 KB
pub const MAX_CHANNELS_PER_SUB: usize = 100;

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_FRAME: &str = "INVALID_FRAME";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const NOT_SUBSCRIBED: &str = "NOT_SUBSCRIBED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
}

// ── Client frames ────────────────────────────────────────────────────────────

/// A channel requested in a `sub` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub id: String,
    #[serde(default)]
    pub restricted: bool,
}

/// An attachment referenced by a client message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub filename: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// What a `send` frame asks the relay to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SendPayload {
    Create {
        content: String,
        #[serde(default)]
        attachments: Vec<AttachmentRef>,
    },
    Edit {
        #[serde(rename = "messageId")]
        message_id: String,
        content: String,
    },
    Delete {
        #[serde(rename = "messageId")]
        message_id: String,
    },
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientFrame {
    Sub { channels: Vec<ChannelRequest> },
    Ack { channel: String, cursor: u64 },
    Send { channel: String, payload: SendPayload },
    Resync { channel: String },
    Ping,
}

// ── Server frames ────────────────────────────────────────────────────────────

/// Lifecycle operation of a batched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    Created,
    Updated,
    Deleted,
    Failed,
}

impl EventOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        }
    }
}

/// Author shown alongside a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorInfo {
    pub id: String,
    pub display_name: String,
}

/// Message body carried by a batched event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub message_id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub author: AuthorInfo,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<String>,
    /// True when the message was authored on the external platform.
    #[serde(default)]
    pub external: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One entry of a `batch` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEvent {
    pub op: EventOp,
    pub sequence: u64,
    pub data: EventData,
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ServerFrame {
    Ready {
        session: String,
        protocol: u32,
    },
    Resync {
        channel: String,
        cursor: u64,
    },
    Batch {
        channel: String,
        events: Vec<BatchEvent>,
    },
    Pong,
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
}

impl ServerFrame {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            channel: None,
        }
    }

    pub fn channel_error(
        code: impl Into<String>,
        message: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            channel: Some(channel.into()),
        }
    }
}
