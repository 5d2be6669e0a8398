use super::expect_packet_type;
use crate::encoding::{put_mqtt_string, split_frame, wrap_fixed_header, Reader};
use crate::error::{Result, WireError};
use crate::properties::{decode_properties, encode_properties, Property};
use crate::types::{PacketType, ProtocolVersion, QoS};
use bytes::{BufMut, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub protocol_version: ProtocolVersion,
    pub properties: Vec<Property>,
}

impl PublishPacket {
    /// Creates a `QoS` 0, non-retained PUBLISH.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        protocol_version: ProtocolVersion,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: None,
            protocol_version,
            properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    #[must_use]
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// Fixed header byte: type 3, DUP bit 3, `QoS` bits 2-1, RETAIN bit 0.
    #[must_use]
    pub fn first_byte(&self) -> u8 {
        0x30 | (u8::from(self.dup) << 3) | (self.qos.as_u8() << 1) | u8::from(self.retain)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = BytesMut::new();
        put_mqtt_string(&mut body, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            let packet_id = self
                .packet_id
                .ok_or(WireError::MissingPacketId(self.qos.as_u8()))?;
            body.put_u16(packet_id);
        }
        if self.protocol_version.has_properties() {
            encode_properties(&mut body, &self.properties)?;
        }
        body.put_slice(&self.payload);
        wrap_fixed_header(self.first_byte(), &body)
    }

    pub fn decode(data: &[u8], protocol_version: ProtocolVersion) -> Result<Self> {
        let (first_byte, body) = split_frame(data)?;
        expect_packet_type(first_byte, PacketType::Publish, "PUBLISH")?;
        let qos = QoS::try_from((first_byte >> 1) & 0x03)?;
        let mut reader = Reader::new(body);
        let topic = reader.read_string()?;
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(reader.read_u16()?)
        };
        let properties = if protocol_version.has_properties() {
            decode_properties(&mut reader)?
        } else {
            Vec::new()
        };
        Ok(Self {
            topic,
            payload: reader.rest().to_vec(),
            qos,
            retain: first_byte & 0x01 == 0x01,
            dup: first_byte & 0x08 == 0x08,
            packet_id,
            protocol_version,
            properties,
        })
    }
}
