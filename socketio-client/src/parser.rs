//! Socket.IO wire codec.
//!
//! A packet encodes to one primary text frame followed by zero or more raw
//! byte attachments. The primary frame is, in order: the type digit, the
//! attachment count and `-` (binary types only), the namespace and `,`
//! (non-default namespaces only), the decimal acknowledgement id (when one
//! was requested), and the JSON data with every binary leaf replaced by a
//! placeholder object.
//!
//! Decoding is stateful: a binary-carrying primary frame parks the packet
//! until its attachments arrived, each one filling the next placeholder in
//! depth-first order. At most one packet reconstructs at a time.

use bytes::Bytes;
use tracing::debug;

use crate::errors::Error;
use crate::packet::{Packet, Type, DEFAULT_NAMESPACE};
use crate::value::Value;

const ATTACHMENT_SEPARATOR: char = '-';
const NAMESPACE_START: char = '/';
const NAMESPACE_END: char = ',';
const DATA_START: char = '[';

/// Encode a packet into its primary frame plus ordered attachments.
pub fn encode(packet: &Packet) -> Result<(String, Vec<Bytes>), Error> {
    let mut attachments = Vec::new();
    let json = packet
        .data
        .as_ref()
        .map(|data| data.to_json_with_placeholders(&mut attachments));

    let binary = matches!(packet.ptype, Type::BinaryEvent | Type::BinaryAck);
    if !binary && !attachments.is_empty() {
        return Err(Error::BinaryInPlainPacket);
    }

    let mut out = String::new();
    out.push(char::from(b'0' + packet.ptype.value()));
    if binary {
        out.push_str(&attachments.len().to_string());
        out.push(ATTACHMENT_SEPARATOR);
    }
    if packet.namespace != DEFAULT_NAMESPACE {
        out.push_str(&packet.namespace);
        out.push(NAMESPACE_END);
    }
    if packet.id > -1 {
        out.push_str(&packet.id.to_string());
    }
    if let Some(json) = &json {
        out.push_str(&serde_json::to_string(json)?);
    }
    Ok((out, attachments))
}

/// Stateful decoder; one per connection.
#[derive(Debug, Default)]
pub struct Decoder {
    pending: Option<Packet>,
    attachments_left: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a primary text frame. Returns the packet unless it now waits
    /// for binary attachments.
    pub fn decode_str(&mut self, input: &str) -> Result<Option<Packet>, Error> {
        let packet = decode_primary(input)?;
        let binary = matches!(packet.ptype, Type::BinaryEvent | Type::BinaryAck);
        if !binary || packet.attachments == 0 {
            return Ok(Some(packet));
        }
        if self.pending.is_some() {
            return Err(Error::PendingReconstruction);
        }
        debug!(
            "holding packet for {} binary attachment(s)",
            packet.attachments
        );
        self.attachments_left = packet.attachments;
        self.pending = Some(packet);
        Ok(None)
    }

    /// Feed one raw attachment. Returns the reassembled packet once the
    /// last placeholder is filled.
    pub fn decode_bin(&mut self, data: Bytes) -> Result<Option<Packet>, Error> {
        let pending = match self.pending.as_mut() {
            Some(pending) if self.attachments_left > 0 => pending,
            _ => return Err(Error::UnexpectedAttachment),
        };
        let filled = pending
            .data
            .as_mut()
            .map(|value| value.fill_next_placeholder(&data))
            .unwrap_or(false);
        if !filled {
            return Err(Error::NoPlaceholder);
        }
        self.attachments_left -= 1;
        if self.attachments_left == 0 {
            Ok(self.pending.take())
        } else {
            Ok(None)
        }
    }
}

/// Parse a primary frame.
///
/// Separators are only meaningful before the data, so every scan is bounded
/// by the index of the first `[`.
fn decode_primary(input: &str) -> Result<Packet, Error> {
    let bytes = input.as_bytes();
    let first = *bytes.first().ok_or(Error::EmptyFrame)?;
    if !first.is_ascii_digit() {
        return Err(Error::InvalidPacketType(first));
    }
    let ptype = Type::of(first - b'0')?;

    let data_start = input.find(DATA_START).unwrap_or(usize::MAX);
    let mut i = 1;
    let mut attachments = 0;

    if let Some(sep) = input[1..].find(ATTACHMENT_SEPARATOR).map(|p| p + 1) {
        if sep < data_start {
            attachments = input[1..sep]
                .parse()
                .map_err(|_| Error::InvalidAttachments)?;
            i = sep + 1;
        }
    }

    let mut namespace = DEFAULT_NAMESPACE.to_owned();
    if let Some(ns_start) = input[i..].find(NAMESPACE_START).map(|p| p + i) {
        if ns_start < data_start {
            match input[ns_start..].find(NAMESPACE_END).map(|p| p + ns_start) {
                Some(ns_end) if ns_end < data_start => {
                    namespace = input[ns_start..ns_end].to_owned();
                    i = ns_end + 1;
                }
                _ => return Err(Error::MissingNamespaceTerminator),
            }
        }
    }

    let mut id = -1;
    let id_end = bytes[i.min(bytes.len())..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count()
        + i;
    if id_end > i {
        id = input[i..id_end].parse().map_err(|_| Error::InvalidAckId)?;
        i = id_end;
    }

    let data = if i < input.len() {
        let json: serde_json::Value = serde_json::from_str(&input[i..])?;
        Some(Value::from(json))
    } else {
        None
    };

    Ok(Packet {
        ptype,
        namespace,
        id,
        attachments,
        data,
    })
}
