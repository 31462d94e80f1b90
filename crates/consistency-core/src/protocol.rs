//! Wire messages and the codec capabilities the adapters are built on.
//!
//! Every message on every channel is a JSON object of the shape
//! `{"message": <kind>, "data": {"uri": <id>}}`:
//!
//! | Direction        | `message`      |
//! |------------------|----------------|
//! | backend → server | `"update"`     |
//! | client → server  | `"watch"`      |
//! | server → client  | `"invalidate"` |
//!
//! Unknown `message` kinds decode to an `Unknown` command so newer peers can
//! talk to an older server. Structural problems are [`ProtocolError`]s.

use serde::Serialize;
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::ids::ResourceId;

/// `message` value of a client subscription request.
pub const WATCH: &str = "watch";
/// `message` value of a backend change notification.
pub const UPDATE: &str = "update";
/// `message` value of a server push.
pub const INVALIDATE: &str = "invalidate";

/// A decoded client → server message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientCommand {
    /// Subscribe to invalidations for `uri`.
    Watch {
        /// Resource to watch.
        uri: ResourceId,
    },
    /// A well-formed message of a kind this server does not handle.
    Unknown(String),
}

/// A decoded backend → server message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestCommand {
    /// The resource `uri` changed.
    Update {
        /// Resource that changed.
        uri: ResourceId,
    },
    /// A well-formed message of a kind this server does not handle.
    Unknown(String),
}

/// A server → client push.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    /// The client's view of `uri` is stale.
    Invalidate {
        /// Resource that changed.
        uri: ResourceId,
    },
}

/// Wire format of the client channel.
///
/// Swapping the implementation changes what clients send and receive
/// without touching the registry.
pub trait ClientProtocol: Send + Sync {
    /// Decode one inbound text frame.
    fn decode(&self, text: &str) -> Result<ClientCommand, ProtocolError>;

    /// Encode one outbound push as a text frame.
    fn encode(&self, event: &ServerEvent) -> Result<String, ProtocolError>;
}

/// Wire format of the backend ingress channel.
pub trait IngestSource: Send + Sync {
    /// Decode one complete frame received from a backend.
    fn data_received(&self, frame: &[u8]) -> Result<IngestCommand, ProtocolError>;
}

/// The default JSON envelope codec for both channels.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonProtocol;

#[derive(Serialize)]
struct Envelope<'a> {
    message: &'a str,
    data: UriData<'a>,
}

#[derive(Serialize)]
struct UriData<'a> {
    uri: &'a ResourceId,
}

impl ClientProtocol for JsonProtocol {
    fn decode(&self, text: &str) -> Result<ClientCommand, ProtocolError> {
        let (message, data) = parse_envelope(text)?;
        if message == WATCH {
            Ok(ClientCommand::Watch {
                uri: extract_uri(data)?,
            })
        } else {
            Ok(ClientCommand::Unknown(message))
        }
    }

    fn encode(&self, event: &ServerEvent) -> Result<String, ProtocolError> {
        let envelope = match event {
            ServerEvent::Invalidate { uri } => Envelope {
                message: INVALIDATE,
                data: UriData { uri },
            },
        };
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

impl IngestSource for JsonProtocol {
    fn data_received(&self, frame: &[u8]) -> Result<IngestCommand, ProtocolError> {
        let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;
        let (message, data) = parse_envelope(text)?;
        if message == UPDATE {
            Ok(IngestCommand::Update {
                uri: extract_uri(data)?,
            })
        } else {
            Ok(IngestCommand::Unknown(message))
        }
    }
}

/// Split a frame into its `message` kind and optional `data` payload.
fn parse_envelope(text: &str) -> Result<(String, Option<Value>), ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(ProtocolError::InvalidField {
            field: "<root>",
            expected: "an object",
        });
    };
    let message = match map.remove("message") {
        Some(Value::String(message)) => message,
        Some(_) => {
            return Err(ProtocolError::InvalidField {
                field: "message",
                expected: "a string",
            })
        }
        None => return Err(ProtocolError::MissingField("message")),
    };
    Ok((message, map.remove("data")))
}

fn extract_uri(data: Option<Value>) -> Result<ResourceId, ProtocolError> {
    let Some(data) = data else {
        return Err(ProtocolError::MissingField("data"));
    };
    let Value::Object(mut data) = data else {
        return Err(ProtocolError::InvalidField {
            field: "data",
            expected: "an object",
        });
    };
    match data.remove("uri") {
        Some(Value::String(uri)) => Ok(ResourceId::from(uri)),
        Some(_) => Err(ProtocolError::InvalidField {
            field: "data.uri",
            expected: "a string",
        }),
        None => Err(ProtocolError::MissingField("data.uri")),
    }
}
