//! Wire packets exchanged between ponycloud daemons.
//!
//! A connection starts with a handshake: the dialing peer sends
//! [`Packet::Hello`] advertising its identity, the hub answers with
//! [`Packet::Welcome`]. After that only [`Packet::Message`] flows.

use std::time::Duration;

use pony_types::Identity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How long either side waits for the other half of the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level frame payload, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Packet {
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<Identity>,
    },
    Welcome {
        hub: Identity,
        identity: Identity,
    },
    Message(Message),
}

impl Packet {
    /// Short name of the packet kind, for logging.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Packet::Hello { .. } => "hello",
            Packet::Welcome { .. } => "welcome",
            Packet::Message(_) => "message",
        }
    }
}

/// A routed message. The payload is opaque to the router; only the
/// dispatcher decodes it according to `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Identity>,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    #[must_use]
    pub fn new(
        sender: Identity,
        recipient: Option<Identity>,
        kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            sender,
            recipient,
            kind: kind.into(),
            payload,
        }
    }

    /// Decode the payload into a typed event.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}
