// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};

use crate::base::{DecodePacket, EncodePacket, PacketId, QoS};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};

/// Per-topic outcome of a SUBSCRIBE request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SubscribeAck {
    Granted(QoS),
    Failed,
}

/// Reply to a SUBSCRIBE packet, one ack per requested topic filter in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubscribeAckPacket {
    packet_id: PacketId,
    acks: Vec<SubscribeAck>,
}

impl SubscribeAckPacket {
    #[must_use]
    pub fn new(packet_id: PacketId, acks: Vec<SubscribeAck>) -> Self {
        Self { packet_id, acks }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn acks(&self) -> &[SubscribeAck] {
        &self.acks
    }
}

impl DecodePacket for SubscribeAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::SubscribeAck {
            return Err(DecodeError::InvalidPacketType);
        }

        let packet_id = ba.read_u16()?;
        let mut consumed = 2;
        let mut acks = Vec::new();

        while consumed < fixed_header.remaining_length() {
            let byte = ba.read_byte()?;
            consumed += 1;
            let ack = match byte {
                0b1000_0000 => SubscribeAck::Failed,
                0b0000_0000 => SubscribeAck::Granted(QoS::AtMostOnce),
                0b0000_0001 => SubscribeAck::Granted(QoS::AtLeastOnce),
                0b0000_0010 => SubscribeAck::Granted(QoS::ExactlyOnce),
                _ => return Err(DecodeError::InvalidQoS),
            };
            acks.push(ack);
        }

        Ok(Self { packet_id, acks })
    }
}

impl EncodePacket for SubscribeAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let fixed_header = FixedHeader::new(PacketType::SubscribeAck, 2 + self.acks.len())?;
        fixed_header.encode(buf)?;
        buf.write_u16::<BigEndian>(self.packet_id)?;
        for ack in &self.acks {
            buf.push(match ack {
                SubscribeAck::Failed => 0b1000_0000,
                SubscribeAck::Granted(qos) => *qos as u8,
            });
        }
        Ok(buf.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let packet = SubscribeAckPacket::new(
            9,
            vec![SubscribeAck::Granted(QoS::AtLeastOnce), SubscribeAck::Failed],
        );
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(SubscribeAckPacket::decode(&mut ba).unwrap(), packet);
    }
}
