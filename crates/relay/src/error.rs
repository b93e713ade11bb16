use crate::platform::PlatformError;

/// Crate-wide result type for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced synchronously to the caller of a relay operation.
///
/// Transient platform failures never appear here: the relay worker absorbs
/// them, and exhausted or structural failures become `failed` events.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Client input rejected before anything was relayed.
    #[error("invalid relay input: {message}")]
    Validation { message: String },

    /// Edit or delete of a message the relay has no record of.
    #[error("unknown message {message_id} in channel {channel_id}")]
    NotFound {
        channel_id: String,
        message_id: String,
    },

    /// Channel operation on a session that never subscribed to it.
    #[error("session is not subscribed to channel {channel_id}")]
    NotSubscribed { channel_id: String },

    /// Session id unknown to the registry, or the hub has shut down.
    #[error("unknown session {session_id}")]
    UnknownSession { session_id: String },

    /// Platform call failed outside the retry loop.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// Collaborator store failed.
    #[error(transparent)]
    Store(#[from] anyhow::Error),

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    Message(String),
}

impl Error {
    #[must_use]
    pub fn validation(message: impl std::fmt::Display) -> Self {
        Self::Validation {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn not_found(channel_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self::NotFound {
            channel_id: channel_id.into(),
            message_id: message_id.into(),
        }
    }
}

impl guildrelay_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

guildrelay_common::impl_context!();
