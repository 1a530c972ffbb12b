// erssi-proto: upstream message model and frame crypto.
//
// The upstream speaks tagged JSON over WebSocket. Field names on the wire
// are inconsistent: `channel` aliases `target` and, on inbound messages,
// `server` aliases `server_tag`. Normalization happens here, at the parse
// boundary; nothing outside this crate sees both names.

use serde::{Deserialize, Serialize};

pub mod crypto;
pub mod dump;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// The `type` tag of an upstream message.
///
/// Unknown tags survive as `Other` so a newer upstream does not kill the
/// read loop; the bridge logs and skips them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Message,
    ChannelJoin,
    ChannelPart,
    UserQuit,
    Topic,
    Nicklist,
    StateDump,
    SyncServer,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Message => "message",
            EventKind::ChannelJoin => "channel_join",
            EventKind::ChannelPart => "channel_part",
            EventKind::UserQuit => "user_quit",
            EventKind::Topic => "topic",
            EventKind::Nicklist => "nicklist",
            EventKind::StateDump => "state_dump",
            EventKind::SyncServer => "sync_server",
            EventKind::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> EventKind {
        match s {
            "message" => EventKind::Message,
            "channel_join" => EventKind::ChannelJoin,
            "channel_part" => EventKind::ChannelPart,
            "user_quit" => EventKind::UserQuit,
            "topic" => EventKind::Topic,
            "nicklist" => EventKind::Nicklist,
            "state_dump" => EventKind::StateDump,
            "sync_server" => EventKind::SyncServer,
            other => EventKind::Other(other.to_owned()),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Canonical event
// ---------------------------------------------------------------------------

/// A canonical upstream message.
///
/// `server` is the routing field on outgoing requests; `server_tag` is the
/// origin tag on inbound events. Both are kept because the two directions
/// use different fields for the `sync_server` request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Event {
    pub kind: EventKind,
    pub id: Option<String>,
    pub server: Option<String>,
    pub server_tag: Option<String>,
    pub target: Option<String>,
    pub nick: Option<String>,
    pub text: Option<String>,
    pub level: Option<i64>,
    pub timestamp: Option<i64>,
    pub is_own: bool,
    pub is_highlight: bool,
    pub extra_data: Option<serde_json::Map<String, serde_json::Value>>,
    pub response_to: Option<String>,
}

impl Default for EventKind {
    fn default() -> Self {
        EventKind::Other(String::new())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no type tag")]
    MissingType,
}

/// The on-wire shape, with every alias the upstream is known to emit.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireEvent {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    /// Inbound alias for `target`; never serialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nick: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    level: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_own: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_highlight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra_data: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_to: Option<String>,
}

impl Event {
    /// Parse one inbound JSON document and normalize field aliases.
    ///
    /// Inbound messages may say `channel` for `target` and `server` for
    /// `server_tag`; canonical names win when both are present.
    pub fn from_json(text: &str) -> Result<Event, ProtoError> {
        let wire: WireEvent = serde_json::from_str(text)?;
        let kind = wire.kind.ok_or(ProtoError::MissingType)?;
        Ok(Event {
            kind: EventKind::parse(&kind),
            id: wire.id,
            server: None,
            server_tag: wire.server_tag.or(wire.server),
            target: wire.target.or(wire.channel),
            nick: wire.nick,
            text: wire.text,
            level: wire.level,
            timestamp: wire.timestamp,
            is_own: wire.is_own,
            is_highlight: wire.is_highlight,
            extra_data: wire.extra_data,
            response_to: wire.response_to,
        })
    }

    /// Serialize an outgoing request under the canonical field names.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        let wire = WireEvent {
            kind: Some(self.kind.as_str().to_owned()),
            id: self.id.clone(),
            server: self.server.clone(),
            server_tag: self.server_tag.clone(),
            target: self.target.clone(),
            channel: None,
            nick: self.nick.clone(),
            text: self.text.clone(),
            level: self.level,
            timestamp: self.timestamp,
            is_own: self.is_own,
            is_highlight: self.is_highlight,
            extra_data: self.extra_data.clone(),
            response_to: self.response_to.clone(),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    // -----------------------------------------------------------------------
    // Outgoing request constructors
    // -----------------------------------------------------------------------

    /// Request the full state snapshot for every server.
    pub fn state_dump_request() -> Event {
        Event {
            kind: EventKind::SyncServer,
            server: Some("*".to_owned()),
            ..Event::default()
        }
    }

    /// Request the nick list of one channel.
    pub fn nicklist_request(server_tag: &str, target: &str) -> Event {
        Event {
            kind: EventKind::Nicklist,
            server_tag: Some(server_tag.to_owned()),
            target: Some(target.to_owned()),
            ..Event::default()
        }
    }

    /// Send a message (or command) to a target on a server.
    pub fn message_to(server_tag: &str, target: &str, text: &str) -> Event {
        Event {
            kind: EventKind::Message,
            server_tag: Some(server_tag.to_owned()),
            target: Some(target.to_owned()),
            text: Some(text.to_owned()),
            ..Event::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Nick list payload
// ---------------------------------------------------------------------------

/// One entry of a nick-list response, carried JSON-encoded in `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NickEntry {
    pub nick: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub host: String,
}

/// Decode the `text` field of a `nicklist` event.
pub fn parse_nicklist(text: &str) -> Result<Vec<NickEntry>, ProtoError> {
    Ok(serde_json::from_str(text)?)
}
