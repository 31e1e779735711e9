//! Engine.IO v4 / Socket.IO v5 text framing.
//!
//! Each WebSocket text message is one Engine.IO packet: a type digit followed
//! by its data. Socket.IO packets travel inside Engine.IO `message` packets,
//! so a named event on the default namespace looks like
//! `42["callUser",{...}]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::error::{Result, SocketError};

pub const DEFAULT_NAMESPACE: &str = "/";
const SOCKET_IO_PATH: &str = "/socket.io/?EIO=4&transport=websocket";

/// Data of the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

impl Handshake {
    /// How long to wait for the next ping before calling the connection dead.
    pub fn ping_deadline(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SocketError::MalformedPacket("empty engine packet".to_string()))?;
        let data = chars.as_str();
        Ok(match kind {
            '0' => Self::Open(serde_json::from_str(data)?),
            '1' => Self::Close,
            '2' => Self::Ping(data.to_string()),
            '3' => Self::Pong(data.to_string()),
            '4' => Self::Message(data.to_string()),
            '5' => Self::Upgrade,
            '6' => Self::Noop,
            'b' => return Err(SocketError::BinaryUnsupported),
            other => {
                return Err(SocketError::MalformedPacket(format!(
                    "unknown engine packet type '{other}'"
                )));
            }
        })
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Open(handshake) => {
                format!("0{}", serde_json::to_string(handshake).unwrap_or_default())
            }
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        event: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Option<Value>,
    },
}

impl SocketPacket {
    /// Join request for the default namespace.
    pub fn connect() -> Self {
        Self::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            data: None,
        }
    }

    /// Unacknowledged event on the default namespace with a single argument.
    pub fn event(event: &str, payload: Value) -> Self {
        Self::Event {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ack_id: None,
            event: event.to_string(),
            args: vec![payload],
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Self::Connect { namespace, .. }
            | Self::Disconnect { namespace }
            | Self::Event { namespace, .. }
            | Self::Ack { namespace, .. }
            | Self::ConnectError { namespace, .. } => namespace,
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| malformed("empty socket packet"))?;
        let mut rest = chars.as_str();

        match kind {
            '0'..='4' => {}
            '5' | '6' => return Err(SocketError::BinaryUnsupported),
            other => return Err(malformed(format!("unknown socket packet type '{other}'"))),
        }

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(end) => {
                    let namespace = &rest[..end];
                    rest = &rest[end + 1..];
                    namespace.to_string()
                }
                None => {
                    let namespace = rest.to_string();
                    rest = "";
                    namespace
                }
            }
        } else {
            DEFAULT_NAMESPACE.to_string()
        };

        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let ack_id = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|e| malformed(format!("bad ack id: {e}")))?,
            )
        } else {
            None
        };
        rest = &rest[digits..];

        let data = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(rest)?)
        };

        Ok(match kind {
            '0' => Self::Connect { namespace, data },
            '1' => Self::Disconnect { namespace },
            '2' => {
                let Some(Value::Array(mut items)) = data else {
                    return Err(malformed("event data must be an array"));
                };
                if items.is_empty() {
                    return Err(malformed("event without a name"));
                }
                let Value::String(event) = items.remove(0) else {
                    return Err(malformed("event name must be a string"));
                };
                Self::Event {
                    namespace,
                    ack_id,
                    event,
                    args: items,
                }
            }
            '3' => {
                let ack_id = ack_id.ok_or_else(|| malformed("ack without id"))?;
                let args = match data {
                    Some(Value::Array(items)) => items,
                    None => Vec::new(),
                    Some(_) => return Err(malformed("ack data must be an array")),
                };
                Self::Ack {
                    namespace,
                    ack_id,
                    args,
                }
            }
            _ => Self::ConnectError { namespace, data },
        })
    }

    pub fn encode(&self) -> String {
        let kind = match self {
            Self::Connect { .. } => '0',
            Self::Disconnect { .. } => '1',
            Self::Event { .. } => '2',
            Self::Ack { .. } => '3',
            Self::ConnectError { .. } => '4',
        };
        let mut out = String::new();
        out.push(kind);
        let namespace = self.namespace();
        if namespace != DEFAULT_NAMESPACE {
            out.push_str(namespace);
            out.push(',');
        }

        match self {
            Self::Connect { data, .. } | Self::ConnectError { data, .. } => {
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
            }
            Self::Disconnect { .. } => {}
            Self::Event {
                ack_id,
                event,
                args,
                ..
            } => {
                if let Some(id) = ack_id {
                    out.push_str(&id.to_string());
                }
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(event.clone()));
                items.extend(args.iter().cloned());
                out.push_str(&Value::Array(items).to_string());
            }
            Self::Ack { ack_id, args, .. } => {
                out.push_str(&ack_id.to_string());
                out.push_str(&Value::Array(args.clone()).to_string());
            }
        }
        out
    }
}

fn malformed(reason: impl Into<String>) -> SocketError {
    SocketError::MalformedPacket(reason.into())
}

/// Complete WebSocket text frame emitting `event` with `payload`.
pub fn event_frame(event: &str, payload: Value) -> String {
    EnginePacket::Message(SocketPacket::event(event, payload).encode()).encode()
}

/// Frame that joins the default namespace.
pub fn connect_frame() -> String {
    EnginePacket::Message(SocketPacket::connect().encode()).encode()
}

/// WebSocket endpoint for a signaling server base url.
///
/// `http://host:5000` becomes `ws://host:5000/socket.io/?EIO=4&transport=websocket`.
pub fn socket_io_url(base: &str) -> Result<String> {
    let base = base.trim();
    let (scheme, rest) = if let Some(rest) = base.strip_prefix("https://") {
        ("wss://", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        ("ws://", rest)
    } else if let Some(rest) = base.strip_prefix("wss://") {
        ("wss://", rest)
    } else if let Some(rest) = base.strip_prefix("ws://") {
        ("ws://", rest)
    } else {
        return Err(SocketError::InvalidUrl(base.to_string()));
    };

    let rest = rest.trim_end_matches('/');
    if rest.is_empty() || rest.contains('?') || rest.contains('#') {
        return Err(SocketError::InvalidUrl(base.to_string()));
    }
    Ok(format!("{scheme}{rest}{SOCKET_IO_PATH}"))
}
