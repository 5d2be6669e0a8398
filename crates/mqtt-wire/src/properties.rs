//! MQTT v5.0 properties, kept in caller order.
//!
//! Brokers are free to choose the order in which they emit properties, so an
//! expected frame has to list them in the same order the broker writes them.
//! [`encode_properties`] therefore never sorts or deduplicates.

#![allow(clippy::cast_possible_truncation)]

use crate::encoding::{encode_variable_int, put_binary, put_mqtt_string, Reader};
use crate::error::{Result, WireError};
use bytes::{BufMut, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    SessionExpiryInterval(u32),
    AssignedClientIdentifier(String),
    ServerKeepAlive(u16),
    ReasonString(String),
    ReceiveMaximum(u16),
    TopicAliasMaximum(u16),
    TopicAlias(u16),
    MaximumQoS(u8),
    RetainAvailable(bool),
    UserProperty(String, String),
    MaximumPacketSize(u32),
}

impl Property {
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            Self::PayloadFormatIndicator(_) => 0x01,
            Self::MessageExpiryInterval(_) => 0x02,
            Self::ContentType(_) => 0x03,
            Self::SessionExpiryInterval(_) => 0x11,
            Self::AssignedClientIdentifier(_) => 0x12,
            Self::ServerKeepAlive(_) => 0x13,
            Self::ReasonString(_) => 0x1F,
            Self::ReceiveMaximum(_) => 0x21,
            Self::TopicAliasMaximum(_) => 0x22,
            Self::TopicAlias(_) => 0x23,
            Self::MaximumQoS(_) => 0x24,
            Self::RetainAvailable(_) => 0x25,
            Self::UserProperty(..) => 0x26,
            Self::MaximumPacketSize(_) => 0x27,
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.id());
        match self {
            Self::PayloadFormatIndicator(v) | Self::MaximumQoS(v) => buf.put_u8(*v),
            Self::RetainAvailable(v) => buf.put_u8(u8::from(*v)),
            Self::ServerKeepAlive(v)
            | Self::ReceiveMaximum(v)
            | Self::TopicAliasMaximum(v)
            | Self::TopicAlias(v) => buf.put_u16(*v),
            Self::MessageExpiryInterval(v)
            | Self::SessionExpiryInterval(v)
            | Self::MaximumPacketSize(v) => buf.put_u32(*v),
            Self::ContentType(s) | Self::AssignedClientIdentifier(s) | Self::ReasonString(s) => {
                put_mqtt_string(buf, s)?;
            }
            Self::UserProperty(key, value) => {
                put_mqtt_string(buf, key)?;
                put_binary(buf, value.as_bytes())?;
            }
        }
        Ok(())
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let id = reader.read_u8()?;
        let property = match id {
            0x01 => Self::PayloadFormatIndicator(reader.read_u8()?),
            0x02 => Self::MessageExpiryInterval(reader.read_u32()?),
            0x03 => Self::ContentType(reader.read_string()?),
            0x11 => Self::SessionExpiryInterval(reader.read_u32()?),
            0x12 => Self::AssignedClientIdentifier(reader.read_string()?),
            0x13 => Self::ServerKeepAlive(reader.read_u16()?),
            0x1F => Self::ReasonString(reader.read_string()?),
            0x21 => Self::ReceiveMaximum(reader.read_u16()?),
            0x22 => Self::TopicAliasMaximum(reader.read_u16()?),
            0x23 => Self::TopicAlias(reader.read_u16()?),
            0x24 => Self::MaximumQoS(reader.read_u8()?),
            0x25 => Self::RetainAvailable(reader.read_u8()? != 0),
            0x26 => Self::UserProperty(reader.read_string()?, reader.read_string()?),
            0x27 => Self::MaximumPacketSize(reader.read_u32()?),
            other => return Err(WireError::UnknownProperty(other)),
        };
        Ok(property)
    }
}

/// Appends the property length followed by each property in slice order.
pub fn encode_properties(buf: &mut BytesMut, properties: &[Property]) -> Result<()> {
    let mut block = BytesMut::new();
    for property in properties {
        property.encode(&mut block)?;
    }
    let len = u32::try_from(block.len())
        .map_err(|_| WireError::RemainingLengthTooLarge(block.len()))?;
    encode_variable_int(buf, len)?;
    buf.put_slice(&block);
    Ok(())
}

/// Reads a length-prefixed property block.
pub fn decode_properties(reader: &mut Reader<'_>) -> Result<Vec<Property>> {
    let len = reader.read_variable_int()? as usize;
    let mut block = Reader::new(reader.take(len)?);
    let mut properties = Vec::new();
    while !block.is_empty() {
        properties.push(Property::decode(&mut block)?);
    }
    Ok(properties)
}
