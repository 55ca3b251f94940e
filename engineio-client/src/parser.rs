//! Engine.IO wire codec.
//!
//! Packets travel in two shapes. The websocket transport frames one packet
//! at a time: `<digit><text>` in a text frame, `[type, bytes...]` in a
//! binary frame. The polling transport exchanges *payloads* (ordered packet
//! sequences) in an HTTP body, with two framings:
//!
//! * binary framing, used whenever any packet in the payload is binary:
//!   `[marker][length digits as raw bytes][0xFF][type][payload bytes]`,
//!   where `marker` is 0x00 for text packets and 0x01 for binary ones,
//!   `length` is `payload size + 1` written one decimal digit per byte, and
//!   the type byte is the raw value for binary packets or the ASCII digit
//!   for text ones;
//! * string framing, used when every packet is text:
//!   `<char count>:<digit><text>` repeated.
//!
//! Decoding accepts both framings; which one a response uses is signalled
//! by its content type.

use crate::errors::Error;
use crate::packet::{Data, Packet, PacketType};

const STRING_DATA_MARKER: u8 = 0x00;
const BINARY_DATA_MARKER: u8 = 0x01;
const BINARY_DATA_SEPARATOR: u8 = 0xFF;
const STRING_DATA_SEPARATOR: char = ':';

/// A single encoded packet, ready for a websocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Encode a single packet for the websocket transport.
pub fn encode_packet(packet: &Packet) -> Frame {
    match &packet.data {
        Data::Binary(bin) => {
            let mut out = Vec::with_capacity(bin.len() + 1);
            out.push(packet.ptype.value());
            out.extend_from_slice(bin);
            Frame::Binary(out)
        }
        Data::Text(text) => Frame::Text(format!("{}{}", packet.ptype.value(), text)),
        Data::None => Frame::Text(packet.ptype.value().to_string()),
    }
}

/// Decode a single packet received as a websocket text frame.
pub fn decode_packet_str(input: &str) -> Result<Packet, Error> {
    let mut chars = input.chars();
    let first = chars.next().ok_or(Error::TruncatedPayload)?;
    let value = first
        .to_digit(10)
        .ok_or(Error::InvalidPacketType(first as u8))?;
    let ptype = PacketType::of(value as u8)?;
    Ok(Packet::new(ptype, chars.as_str()))
}

/// Decode a single packet received as a websocket binary frame.
pub fn decode_packet_bin(input: &[u8]) -> Result<Packet, Error> {
    let (&first, rest) = input.split_first().ok_or(Error::TruncatedPayload)?;
    let ptype = PacketType::of(first)?;
    Ok(Packet::new(ptype, rest.to_vec()))
}

/// Encode a payload for a polling POST.
///
/// Returns the body plus a flag telling whether the binary framing was used,
/// which selects the request content type (`application/octet-stream` vs
/// `text/plain; charset=UTF-8`).
pub fn encode_payload(packets: &[Packet]) -> (Vec<u8>, bool) {
    let has_binary = packets.iter().any(Packet::is_binary);
    let mut out = Vec::new();
    if has_binary {
        for packet in packets {
            encode_bin_framed(packet, &mut out);
        }
    } else {
        for packet in packets {
            encode_str_framed(packet, &mut out);
        }
    }
    (out, has_binary)
}

fn encode_bin_framed(packet: &Packet, out: &mut Vec<u8>) {
    let binary = packet.is_binary();
    out.push(if binary {
        BINARY_DATA_MARKER
    } else {
        STRING_DATA_MARKER
    });
    // Length covers the type byte as well, one raw digit per byte.
    let len = packet.size() + 1;
    for digit in len.to_string().bytes() {
        out.push(digit - b'0');
    }
    out.push(BINARY_DATA_SEPARATOR);
    if binary {
        out.push(packet.ptype.value());
    } else {
        out.push(packet.ptype.value() + b'0');
    }
    out.extend_from_slice(packet.data.as_bytes());
}

fn encode_str_framed(packet: &Packet, out: &mut Vec<u8>) {
    let text = match &packet.data {
        Data::Text(text) => text.as_str(),
        _ => "",
    };
    let count = 1 + text.chars().count();
    out.extend_from_slice(count.to_string().as_bytes());
    out.push(STRING_DATA_SEPARATOR as u8);
    out.push(packet.ptype.value() + b'0');
    out.extend_from_slice(text.as_bytes());
}

/// Decode a binary-framed payload body.
pub fn decode_payload_bin(data: &[u8]) -> Result<Vec<Packet>, Error> {
    let mut packets = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let marker = data[i];
        if marker != STRING_DATA_MARKER && marker != BINARY_DATA_MARKER {
            return Err(Error::InvalidMarker(marker));
        }
        i += 1;

        let mut len: usize = 0;
        let mut digits = 0;
        loop {
            let byte = *data.get(i).ok_or(Error::TruncatedPayload)?;
            if byte == BINARY_DATA_SEPARATOR {
                break;
            }
            if byte > 9 {
                return Err(Error::InvalidLength);
            }
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add(byte as usize))
                .ok_or(Error::InvalidLength)?;
            digits += 1;
            i += 1;
        }
        if digits == 0 {
            return Err(Error::InvalidLength);
        }
        i += 1;

        let type_byte = *data.get(i).ok_or(Error::TruncatedPayload)?;
        let value = if marker == STRING_DATA_MARKER {
            // ASCII digit for text packets.
            type_byte.wrapping_sub(b'0')
        } else {
            type_byte
        };
        let ptype = PacketType::of(value)?;
        i += 1;

        let size = len.checked_sub(1).ok_or(Error::InvalidLength)?;
        let end = i.checked_add(size).ok_or(Error::TruncatedPayload)?;
        if end > data.len() {
            return Err(Error::TruncatedPayload);
        }
        let packet = if size == 0 {
            Packet::empty(ptype)
        } else if marker == STRING_DATA_MARKER {
            Packet::new(ptype, String::from_utf8(data[i..end].to_vec())?)
        } else {
            Packet::new(ptype, data[i..end].to_vec())
        };
        packets.push(packet);
        i = end;
    }
    Ok(packets)
}

/// Decode a string-framed payload body.
pub fn decode_payload_str(data: &str) -> Result<Vec<Packet>, Error> {
    let mut packets = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let colon = rest
            .find(STRING_DATA_SEPARATOR)
            .ok_or(Error::InvalidLength)?;
        let count: usize = rest[..colon].parse().map_err(|_| Error::InvalidLength)?;
        rest = &rest[colon + 1..];

        let end = char_boundary_after(rest, count)?;
        let mut chars = rest[..end].chars();
        let type_char = chars.next().ok_or(Error::TruncatedPayload)?;
        let value = type_char
            .to_digit(10)
            .ok_or(Error::InvalidPacketType(type_char as u8))?;
        let ptype = PacketType::of(value as u8)?;

        let text = chars.as_str();
        let packet = if text.is_empty() {
            Packet::empty(ptype)
        } else {
            Packet::new(ptype, text)
        };
        packets.push(packet);
        rest = &rest[end..];
    }
    Ok(packets)
}

// Byte index just past `count` chars of `s`. The length field counts chars,
// type char included.
fn char_boundary_after(s: &str, count: usize) -> Result<usize, Error> {
    if count == 0 {
        return Err(Error::InvalidLength);
    }
    let mut seen = 0;
    for (idx, ch) in s.char_indices() {
        seen += 1;
        if seen == count {
            return Ok(idx + ch.len_utf8());
        }
    }
    Err(Error::TruncatedPayload)
}
