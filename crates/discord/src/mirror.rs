//! Decoding of gateway dispatch payloads into mirror events.
//!
//! Only message lifecycle dispatches matter to the relay; everything else
//! decodes to an empty list.

use {
    guildrelay_protocol::{AttachmentRef, AuthorInfo},
    guildrelay_relay::{MirrorEvent, MirrorMessage},
    serde::Deserialize,
    serde_json::Value,
};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct Dispatch {
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    d: Value,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    filename: String,
    url: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    author: Option<WireUser>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
    #[serde(default)]
    embeds: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct WireDelete {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireBulkDelete {
    ids: Vec<String>,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
}

impl From<WireMessage> for MirrorMessage {
    fn from(m: WireMessage) -> Self {
        let author = m
            .author
            .map(|u| AuthorInfo {
                display_name: u.global_name.unwrap_or_else(|| u.username.clone()),
                id: u.id,
            })
            .unwrap_or_default();
        Self {
            guild_id: m.guild_id,
            channel_id: m.channel_id,
            remote_id: m.id,
            author,
            content: m.content,
            attachments: m
                .attachments
                .into_iter()
                .map(|a| AttachmentRef {
                    filename: a.filename,
                    url: a.url,
                    content_type: a.content_type,
                })
                .collect(),
            embeds: m.embeds,
        }
    }
}

/// Decode one `{ "t": ..., "d": ... }` dispatch envelope.
pub fn decode_dispatch(payload: &Value) -> Result<Vec<MirrorEvent>> {
    let dispatch = Dispatch::deserialize(payload)?;
    match dispatch.t {
        Some(kind) => decode_event(&kind, dispatch.d),
        None => Err(Error::MissingField("t")),
    }
}

/// Decode the data of a dispatch named `kind`.
pub fn decode_event(kind: &str, data: Value) -> Result<Vec<MirrorEvent>> {
    let events = match kind {
        "MESSAGE_CREATE" => vec![MirrorEvent::Created(
            serde_json::from_value::<WireMessage>(data)?.into(),
        )],
        "MESSAGE_UPDATE" => vec![MirrorEvent::Updated(
            serde_json::from_value::<WireMessage>(data)?.into(),
        )],
        "MESSAGE_DELETE" => {
            let d: WireDelete = serde_json::from_value(data)?;
            vec![MirrorEvent::Deleted {
                guild_id: d.guild_id,
                channel_id: d.channel_id,
                remote_id: d.id,
            }]
        },
        "MESSAGE_DELETE_BULK" => {
            let d: WireBulkDelete = serde_json::from_value(data)?;
            d.ids
                .into_iter()
                .map(|remote_id| MirrorEvent::Deleted {
                    guild_id: d.guild_id.clone(),
                    channel_id: d.channel_id.clone(),
                    remote_id,
                })
                .collect()
        },
        _ => Vec::new(),
    };
    Ok(events)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn decodes_message_create_with_footer_embed() {
        let payload = json!({
            "t": "MESSAGE_CREATE",
            "d": {
                "id": "m1",
                "channel_id": "c1",
                "guild_id": "g1",
                "author": {"id": "u1", "username": "alice", "global_name": "Alice"},
                "content": "hi",
                "attachments": [{"filename": "a.png", "url": "https://cdn.test/a.png", "content_type": "image/png"}],
                "embeds": [{"description": "hi", "footer": {"text": "relay-ref:abc"}}],
                "webhook_id": "w1"
            }
        });
        let events = decode_dispatch(&payload).unwrap();
        let [MirrorEvent::Created(msg)] = events.as_slice() else {
            panic!("expected one create, got {events:?}");
        };
        assert_eq!(msg.remote_id, "m1");
        assert_eq!(msg.guild_id.as_deref(), Some("g1"));
        assert_eq!(msg.author.display_name, "Alice");
        assert_eq!(msg.attachments[0].filename, "a.png");
        assert_eq!(msg.embeds[0]["footer"]["text"], "relay-ref:abc");
    }

    #[test]
    fn display_name_falls_back_to_username() {
        let data = json!({
            "id": "m1",
            "channel_id": "c1",
            "author": {"id": "u1", "username": "bob"},
        });
        let events = decode_event("MESSAGE_UPDATE", data).unwrap();
        let [MirrorEvent::Updated(msg)] = events.as_slice() else {
            panic!("expected one update");
        };
        assert_eq!(msg.author.display_name, "bob");
        assert!(msg.content.is_empty());
    }

    #[test]
    fn bulk_delete_fans_out() {
        let data = json!({"ids": ["m1", "m2"], "channel_id": "c1", "guild_id": "g1"});
        let events = decode_event("MESSAGE_DELETE_BULK", data).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], MirrorEvent::Deleted {
            guild_id: Some("g1".into()),
            channel_id: "c1".into(),
            remote_id: "m2".into(),
        });
    }

    #[test]
    fn unrelated_dispatches_are_empty() {
        let payload = json!({"t": "TYPING_START", "d": {"channel_id": "c1"}});
        assert!(decode_dispatch(&payload).unwrap().is_empty());
    }

    #[test]
    fn missing_kind_is_an_error() {
        let err = decode_dispatch(&json!({"d": {}})).unwrap_err();
        assert!(matches!(err, Error::MissingField("t")));
    }

    #[test]
    fn malformed_message_is_an_error() {
        assert!(decode_event("MESSAGE_DELETE", json!({"id": 5})).is_err());
    }
}
