//! State-dump payload.
//!
//! The upstream sends its full server/channel/query snapshot either as an
//! `extra_data` map or JSON-encoded inside `text`. Both carriers decode to
//! the same shape; declaration order is meaningful and preserved.

use crate::{Event, ProtoError};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StateDump {
    #[serde(default)]
    pub servers: Vec<ServerDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerDump {
    pub tag: String,
    #[serde(default)]
    pub channels: Vec<ChannelDump>,
    #[serde(default)]
    pub queries: Vec<QueryDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelDump {
    pub name: String,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryDump {
    pub nick: String,
}

impl StateDump {
    /// Extract the dump from a `state_dump` event, trying `extra_data`
    /// first and falling back to the JSON `text` carrier.
    pub fn from_event(event: &Event) -> Result<StateDump, ProtoError> {
        if let Some(extra) = &event.extra_data {
            let value = serde_json::Value::Object(extra.clone());
            return Ok(serde_json::from_value(value)?);
        }
        let text = event.text.as_deref().unwrap_or("");
        Ok(serde_json::from_str(text)?)
    }
}
