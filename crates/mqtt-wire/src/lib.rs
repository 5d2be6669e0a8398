//! Byte-exact MQTT frame construction.
//!
//! Conformance checks compare what a broker writes against an expected
//! encoding byte for byte, so every encoder in this crate is deterministic:
//! the same structured input always yields the same bytes, properties are
//! emitted in the order given, and variable byte integers use their minimal
//! form. Only the frames needed to hold a session open and observe server
//! publishes are covered: CONNECT, CONNACK, PUBLISH, PINGREQ and PINGRESP.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod describe;
pub mod encoding;
pub mod error;
pub mod packet;
pub mod properties;
pub mod types;

pub use describe::{describe, to_hex};
pub use encoding::frame_length;
pub use error::{Result, WireError};
pub use packet::{ConnAckPacket, ConnectPacket, PublishPacket, PINGREQ, PINGRESP};
pub use properties::Property;
pub use types::{PacketType, ProtocolVersion, QoS};
