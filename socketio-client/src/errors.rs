/// Error type for the Socket.IO client.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("type ({0}) is not a valid socket.io packet type")]
    InvalidPacketType(u8),
    #[error("received an empty frame")]
    EmptyFrame,
    #[error("invalid attachment count")]
    InvalidAttachments,
    #[error("namespace end symbol (,) is not found")]
    MissingNamespaceTerminator,
    #[error("invalid acknowledgement id")]
    InvalidAckId,
    #[error("error serializing json packet: {0:?}")]
    Json(#[from] serde_json::Error),
    #[error("received a binary packet while another one is already waiting for re-construction")]
    PendingReconstruction,
    #[error("received binary data when there was no re-construction pending packet")]
    UnexpectedAttachment,
    #[error("no placeholder object found for this binary data")]
    NoPlaceholder,
    #[error("binary data is only allowed in binary event and binary ack packets")]
    BinaryInPlainPacket,
    #[error("can't re-open a closed/disconnected socket, create a new instance instead")]
    ClosedSocket,
    #[error("can't parse {0:?} as URL: {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("engineio error: {0}")]
    EngineIo(#[from] engineio_client::Error),
}
