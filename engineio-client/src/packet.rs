//! Engine.IO packet model.

use bytes::Bytes;

use crate::errors::Error;

/// The seven Engine.IO packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
}

impl PacketType {
    /// Look a type up by its wire value. Unknown values are a parse error,
    /// never a panic.
    pub fn of(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(PacketType::Open),
            1 => Ok(PacketType::Close),
            2 => Ok(PacketType::Ping),
            3 => Ok(PacketType::Pong),
            4 => Ok(PacketType::Message),
            5 => Ok(PacketType::Upgrade),
            6 => Ok(PacketType::Noop),
            v => Err(Error::InvalidPacketType(v)),
        }
    }

    pub fn is_valid(value: u8) -> bool {
        value <= 6
    }

    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Packet payload: absent, UTF-8 text, or an opaque byte sequence.
///
/// Whether a packet is binary is a property of this representation, not of
/// the packet type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Data {
    #[default]
    None,
    Text(String),
    Binary(Bytes),
}

impl Data {
    /// Payload size in bytes: UTF-8 length for text, byte length for
    /// binary, 0 otherwise.
    pub fn size(&self) -> usize {
        match self {
            Data::None => 0,
            Data::Text(s) => s.len(),
            Data::Binary(b) => b.len(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Data::None => &[],
            Data::Text(s) => s.as_bytes(),
            Data::Binary(b) => b,
        }
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data::Text(s.to_owned())
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Data::Text(s)
    }
}

impl From<Vec<u8>> for Data {
    fn from(b: Vec<u8>) -> Self {
        Data::Binary(Bytes::from(b))
    }
}

impl From<Bytes> for Data {
    fn from(b: Bytes) -> Self {
        Data::Binary(b)
    }
}

/// An Engine.IO packet: a [`PacketType`] plus an optional payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ptype: PacketType,
    pub data: Data,
}

impl Packet {
    pub fn new(ptype: PacketType, data: impl Into<Data>) -> Self {
        Self {
            ptype,
            data: data.into(),
        }
    }

    pub fn empty(ptype: PacketType) -> Self {
        Self {
            ptype,
            data: Data::None,
        }
    }

    pub fn ping() -> Self {
        Self::empty(PacketType::Ping)
    }

    pub fn noop() -> Self {
        Self::empty(PacketType::Noop)
    }

    pub fn close() -> Self {
        Self::empty(PacketType::Close)
    }

    pub fn message(data: impl Into<Data>) -> Self {
        Self::new(PacketType::Message, data)
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.data, Data::Binary(_))
    }

    /// Payload size in bytes, see [`Data::size`].
    pub fn size(&self) -> usize {
        self.data.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_value_round_trip() {
        for value in 0u8..=6 {
            let ptype = PacketType::of(value).unwrap();
            assert_eq!(ptype.value(), value);
        }
    }

    #[test]
    fn type_of_invalid_value() {
        assert!(matches!(
            PacketType::of(7),
            Err(Error::InvalidPacketType(7))
        ));
        assert!(!PacketType::is_valid(7));
        assert!(PacketType::is_valid(4));
    }

    #[test]
    fn binary_follows_the_payload_not_the_type() {
        assert!(Packet::message(vec![1, 2, 3]).is_binary());
        assert!(!Packet::message("data").is_binary());
        assert!(!Packet::ping().is_binary());
    }

    #[test]
    fn size_is_byte_length() {
        assert_eq!(Packet::message("data").size(), 4);
        assert_eq!(Packet::message("€").size(), 3);
        assert_eq!(Packet::message(vec![1, 2, 3]).size(), 3);
        assert_eq!(Packet::ping().size(), 0);
    }
}
