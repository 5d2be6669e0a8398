use super::expect_packet_type;
use crate::encoding::{split_frame, wrap_fixed_header, Reader};
use crate::error::Result;
use crate::properties::{decode_properties, encode_properties, Property};
use crate::types::{PacketType, ProtocolVersion};
use bytes::{BufMut, BytesMut};

/// CONNACK as a broker writes it.
///
/// `reason_code` is the v5 reason code, or the v3 return code for older
/// protocol versions; both use `0x00` for success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub reason_code: u8,
    pub protocol_version: ProtocolVersion,
    pub properties: Vec<Property>,
}

impl ConnAckPacket {
    #[must_use]
    pub fn new(reason_code: u8, protocol_version: ProtocolVersion) -> Self {
        Self {
            session_present: false,
            reason_code,
            protocol_version,
            properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_session_present(mut self, session_present: bool) -> Self {
        self.session_present = session_present;
        self
    }

    #[must_use]
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: impl IntoIterator<Item = Property>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = BytesMut::new();
        body.put_u8(u8::from(self.session_present));
        body.put_u8(self.reason_code);
        if self.protocol_version.has_properties() {
            encode_properties(&mut body, &self.properties)?;
        }
        wrap_fixed_header(0x20, &body)
    }

    /// Decodes the first frame of `data` as a CONNACK.
    ///
    /// A v5 CONNACK with remaining length 2 (no property block) is accepted.
    pub fn decode(data: &[u8], protocol_version: ProtocolVersion) -> Result<Self> {
        let (first_byte, body) = split_frame(data)?;
        expect_packet_type(first_byte, PacketType::ConnAck, "CONNACK")?;
        let mut reader = Reader::new(body);
        let session_present = reader.read_u8()? & 0x01 == 0x01;
        let reason_code = reader.read_u8()?;
        let properties = if protocol_version.has_properties() && !reader.is_empty() {
            decode_properties(&mut reader)?
        } else {
            Vec::new()
        };
        Ok(Self {
            session_present,
            reason_code,
            protocol_version,
            properties,
        })
    }
}
