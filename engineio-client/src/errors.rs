use tokio_tungstenite::tungstenite;

/// Error type for the Engine.IO client.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),
    #[error("payload starts with an invalid marker byte {0}, accepted ones are 0 or 1")]
    InvalidMarker(u8),
    #[error("invalid length field in payload")]
    InvalidLength,
    #[error("payload ended before the declared packet length")]
    TruncatedPayload,
    #[error("error decoding packet text: {0:?}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("error parsing handshake data: {0:?}")]
    Handshake(#[from] serde_json::Error),
    #[error("unknown transport {0:?}, choose either \"polling\" or \"websocket\"")]
    UnknownTransport(String),
    #[error("transports can't be empty")]
    NoTransports,
    #[error("http transport error: {0:?}")]
    Http(#[from] reqwest::Error),
    #[error("ws transport error: {0:?}")]
    Ws(#[from] tungstenite::Error),
}
