use crate::encoding::{put_mqtt_string, wrap_fixed_header};
use crate::error::Result;
use crate::properties::{encode_properties, Property};
use crate::types::ProtocolVersion;
use bytes::{BufMut, BytesMut};

const CLEAN_START_FLAG: u8 = 0x02;

/// CONNECT request without will, username or password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub protocol_version: ProtocolVersion,
    pub properties: Vec<Property>,
}

impl ConnectPacket {
    /// Creates a CONNECT with `clean_start=true`, keepalive=60s and no
    /// properties.
    #[must_use]
    pub fn new(client_id: impl Into<String>, protocol_version: ProtocolVersion) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: 60,
            clean_start: true,
            protocol_version,
            properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    /// Appends a property. Ignored when encoding for versions before 5.0.
    #[must_use]
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = BytesMut::new();
        put_mqtt_string(&mut body, self.protocol_version.protocol_name())?;
        body.put_u8(self.protocol_version.level());
        body.put_u8(if self.clean_start { CLEAN_START_FLAG } else { 0 });
        body.put_u16(self.keep_alive);
        if self.protocol_version.has_properties() {
            encode_properties(&mut body, &self.properties)?;
        }
        put_mqtt_string(&mut body, &self.client_id)?;

        wrap_fixed_header(0x10, &body)
    }
}
