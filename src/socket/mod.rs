pub mod engineio;
pub mod error;
pub mod websocket;

pub use engineio::{EnginePacket, Handshake, SocketPacket};
pub use error::{Result, SocketError};
pub use websocket::{WebSocketRelayChannel, WebSocketRelayFactory};
