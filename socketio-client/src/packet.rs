//! Socket.IO packet model.

use crate::errors::Error;
use crate::value::Value;

/// Namespace every socket belongs to unless told otherwise.
pub const DEFAULT_NAMESPACE: &str = "/";

/// The seven Socket.IO packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    Error = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl Type {
    /// Look a type up by its wire value. Unknown values are a parse error,
    /// never a panic.
    pub fn of(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Type::Connect),
            1 => Ok(Type::Disconnect),
            2 => Ok(Type::Event),
            3 => Ok(Type::Ack),
            4 => Ok(Type::Error),
            5 => Ok(Type::BinaryEvent),
            6 => Ok(Type::BinaryAck),
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

/// A Socket.IO packet.
///
/// `attachments` counts the binary leaves of `data` in encoded form and is
/// only ever non-zero for [`Type::BinaryEvent`] and [`Type::BinaryAck`].
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub ptype: Type,
    pub namespace: String,
    /// Acknowledgement id; -1 means no acknowledgement was requested.
    pub id: i64,
    pub attachments: usize,
    pub data: Option<Value>,
}

impl Packet {
    pub fn new(ptype: Type, namespace: impl Into<String>, id: i64, data: Option<Value>) -> Self {
        Self {
            ptype,
            namespace: namespace.into(),
            id,
            attachments: 0,
            data,
        }
    }

    pub fn connect(namespace: impl Into<String>) -> Self {
        Self::new(Type::Connect, namespace, -1, None)
    }

    pub fn disconnect(namespace: impl Into<String>) -> Self {
        Self::new(Type::Disconnect, namespace, -1, None)
    }

    /// True when the sender asked for this packet to be acknowledged.
    pub fn should_be_acknowledged(&self) -> bool {
        self.id > -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_value_round_trip() {
        for value in 0u8..=6 {
            assert_eq!(Type::of(value).unwrap().value(), value);
        }
    }

    #[test]
    fn type_of_invalid_value() {
        assert!(matches!(Type::of(7), Err(Error::InvalidPacketType(7))));
        assert!(Type::is_valid(6));
        assert!(!Type::is_valid(7));
    }

    #[test]
    fn ack_is_requested_by_a_non_negative_id() {
        let mut packet = Packet::connect("/");
        assert!(!packet.should_be_acknowledged());
        packet.id = 0;
        assert!(packet.should_be_acknowledged());
    }
}
