//! Handshake data carried by the first OPEN packet.

use serde::Deserialize;

use crate::errors::Error;

/// Session parameters the server sends inside the OPEN packet.
///
/// Parsing fails when any field is missing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeData {
    /// Session id; bound to every subsequent request via the `sid` query.
    pub sid: String,
    /// Transports the server accepts an upgrade to.
    pub upgrades: Vec<String>,
    /// Interval at which the client must send a PING packet, in ms.
    pub ping_interval: u64,
    /// How long after a PING a PONG may take before the session is
    /// considered dead, in ms.
    pub ping_timeout: u64,
}

impl HandshakeData {
    pub fn parse(data: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(data)?)
    }
}
