pub mod connack;
pub mod connect;
pub mod ping;
pub mod publish;

pub use connack::ConnAckPacket;
pub use connect::ConnectPacket;
pub use ping::{PINGREQ, PINGRESP};
pub use publish::PublishPacket;

use crate::error::{Result, WireError};
use crate::types::PacketType;

pub(crate) fn expect_packet_type(
    first_byte: u8,
    expected: PacketType,
    name: &'static str,
) -> Result<()> {
    if PacketType::from_first_byte(first_byte) == expected {
        Ok(())
    } else {
        Err(WireError::UnexpectedPacketType {
            expected: name,
            actual: first_byte,
        })
    }
}
