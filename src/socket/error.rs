use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Socket is closed")]
    SocketClosed,
    #[error("Invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    #[error("Binary packets are not supported")]
    BinaryUnsupported,
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SocketError>;
