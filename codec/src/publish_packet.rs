// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};

use crate::base::{DecodePacket, EncodePacket, PacketId, QoS};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};
use crate::topic::Topic;

/// Application message carried between the broker and a client.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishPacket {
    dup: bool,
    qos: QoS,
    retain: bool,
    topic: Topic,
    packet_id: Option<PacketId>,
    payload: Vec<u8>,
}

impl PublishPacket {
    /// # Errors
    /// Returns error if `qos` is `AtMostOnce` with a `packet_id` present, or
    /// `AtLeastOnce`/`ExactlyOnce` without one.
    pub fn new(
        topic: Topic,
        qos: QoS,
        payload: Vec<u8>,
        retain: bool,
        packet_id: Option<PacketId>,
    ) -> Result<Self, EncodeError> {
        match (qos, packet_id) {
            (QoS::AtMostOnce, Some(_)) | (QoS::AtLeastOnce | QoS::ExactlyOnce, None) => {
                Err(EncodeError::TooManyData)
            }
            _ => Ok(Self {
                dup: false,
                qos,
                retain,
                topic,
                packet_id,
                payload,
            }),
        }
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    #[must_use]
    pub const fn packet_id(&self) -> Option<PacketId> {
        self.packet_id
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_dup(&mut self, dup: bool) -> &mut Self {
        self.dup = dup;
        self
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };

        let remaining_length = fixed_header.remaining_length();
        let topic_len = ba.read_u16()? as usize;
        let topic = Topic::parse(&ba.read_string(topic_len)?)?;

        let mut consumed = 2 + topic_len;
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            consumed += 2;
            Some(ba.read_u16()?)
        };

        if remaining_length < consumed {
            return Err(DecodeError::InvalidPacketFlags);
        }
        let payload_len = remaining_length - consumed;
        let payload = ba.read_bytes(payload_len)?.to_vec();

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let topic_bytes = self.topic.as_str().as_bytes();
        if topic_bytes.len() > usize::from(u16::MAX) {
            return Err(EncodeError::TooManyData);
        }

        let mut remaining_length = 2 + topic_bytes.len() + self.payload.len();
        if self.packet_id.is_some() {
            remaining_length += 2;
        }

        let fixed_header = FixedHeader::new(
            PacketType::Publish {
                dup: self.dup,
                qos: self.qos,
                retain: self.retain,
            },
            remaining_length,
        )?;
        fixed_header.encode(buf)?;

        buf.write_u16::<BigEndian>(topic_bytes.len() as u16)?;
        buf.write_all(topic_bytes)?;
        if let Some(packet_id) = self.packet_id {
            buf.write_u16::<BigEndian>(packet_id)?;
        }
        buf.write_all(&self.payload)?;

        Ok(buf.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_at_most_once() {
        let topic = Topic::parse("nas/telemetry").unwrap();
        let packet = PublishPacket::new(topic, QoS::AtMostOnce, b"hello".to_vec(), false, None).unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn round_trip_at_least_once_with_packet_id() {
        let topic = Topic::parse("nas/telemetry").unwrap();
        let packet = PublishPacket::new(topic, QoS::AtLeastOnce, b"hi".to_vec(), true, Some(42)).unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.packet_id(), Some(42));
        assert!(decoded.retain());
    }

    #[test]
    fn rejects_mismatched_qos_and_packet_id() {
        let topic = Topic::parse("nas/telemetry").unwrap();
        assert!(PublishPacket::new(topic.clone(), QoS::AtMostOnce, vec![], false, Some(1)).is_err());
        assert!(PublishPacket::new(topic, QoS::AtLeastOnce, vec![], false, None).is_err());
    }
}
