use {
    guildrelay_protocol::{AttachmentRef, AuthorInfo, EventData},
    serde::{Deserialize, Serialize},
};

/// A chat message as the relay sees it, whichever side authored it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalMessage {
    pub local_id: String,
    pub channel_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    /// Minted on first relay; edits and deletes reuse it.
    pub correlation_token: Option<String>,
    pub author: AuthorInfo,
    pub is_restricted: bool,
    /// Platform message id once relayed or ingested.
    pub remote_id: Option<String>,
    /// True for messages authored on the external platform.
    pub external: bool,
    /// Edits accepted so far. Each edit's `updated` event carries the new count.
    #[serde(default)]
    pub revision: u64,
}

impl LogicalMessage {
    /// Event body describing this message.
    pub fn event_data(&self) -> EventData {
        EventData {
            message_id: self.local_id.clone(),
            channel_id: self.channel_id.clone(),
            remote_id: self.remote_id.clone(),
            author: self.author.clone(),
            content: self.content.clone(),
            attachments: self.attachments.clone(),
            correlation_token: self.correlation_token.clone(),
            external: self.external,
            reason: None,
        }
    }
}

/// Link between a locally-authored message and its relayed platform copy.
///
/// Unique on `(guild_id, channel_id, correlation_token)` and on
/// `remote_message_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMapping {
    pub guild_id: String,
    pub channel_id: String,
    pub local_message_id: String,
    pub remote_message_id: String,
    /// Endpoint used for the send; empty when the direct path was used.
    pub endpoint_url: String,
    pub correlation_token: String,
}

/// An authenticated principal behind a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    pub fn has_any_role(&self, roles: &[String]) -> bool {
        self.roles
            .iter()
            .any(|r| roles.iter().any(|want| want.eq_ignore_ascii_case(r)))
    }

    pub fn author(&self) -> AuthorInfo {
        AuthorInfo {
            id: self.user_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}
