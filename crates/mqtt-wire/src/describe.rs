//! Human readable rendering of raw frames for failure diagnostics.

use crate::encoding::{frame_length, split_frame, Reader};
use crate::packet::ConnAckPacket;
use crate::types::{PacketType, ProtocolVersion};
use std::fmt::Write;

/// Lowercase, space separated hex dump (`30 1b 00 0c`).
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (idx, byte) in bytes.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Summarises every frame found in `bytes`, e.g.
/// `CONNACK(rc=0x00), PUBLISH(qos=0, topic="topic/reload", 26 bytes)`.
#[must_use]
pub fn describe(bytes: &[u8], protocol_version: ProtocolVersion) -> String {
    if bytes.is_empty() {
        return "nothing".to_owned();
    }
    let mut parts = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        match frame_length(rest) {
            Ok(Some(len)) => {
                parts.push(describe_frame(&rest[..len], protocol_version));
                offset += len;
            }
            Ok(None) => {
                parts.push(format!(
                    "{} ({} bytes, incomplete)",
                    PacketType::from_first_byte(rest[0]),
                    rest.len()
                ));
                break;
            }
            Err(err) => {
                parts.push(format!("{} bytes of garbage ({err})", rest.len()));
                break;
            }
        }
    }
    parts.join(", ")
}

fn describe_frame(frame: &[u8], protocol_version: ProtocolVersion) -> String {
    let packet_type = PacketType::from_first_byte(frame[0]);
    match packet_type {
        PacketType::ConnAck => match ConnAckPacket::decode(frame, protocol_version) {
            Ok(connack) => format!(
                "CONNACK(rc=0x{:02x}, session_present={}, {} properties)",
                connack.reason_code,
                connack.session_present,
                connack.properties.len()
            ),
            Err(_) => format!("CONNACK({} bytes, undecodable)", frame.len()),
        },
        PacketType::Publish => {
            let qos = (frame[0] >> 1) & 0x03;
            let topic = split_frame(frame)
                .ok()
                .and_then(|(_, body)| Reader::new(body).read_string().ok());
            match topic {
                Some(topic) => format!(
                    "PUBLISH(qos={qos}, retain={}, topic={topic:?}, {} bytes)",
                    frame[0] & 0x01 == 0x01,
                    frame.len()
                ),
                None => format!("PUBLISH(qos={qos}, {} bytes, undecodable)", frame.len()),
            }
        }
        other => format!("{other}(flags=0x{:x}, {} bytes)", frame[0] & 0x0F, frame.len()),
    }
}
