// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::base::{DecodePacket, EncodePacket, QoS};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::var_int::VarInt;

/// Control packet type, decoded jointly with the fixed header's flag bits.
///
/// `PublishReceived`, `PublishRelease` and `PublishComplete` are recognised here so
/// that QoS 2 traffic can be rejected with a protocol error instead of
/// `InvalidPacketType`; this broker never emits them and has no packet body types
/// for them.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum PacketType {
    #[default]
    Connect,
    ConnectAck,
    Publish {
        dup: bool,
        qos: QoS,
        retain: bool,
    },
    PublishAck,
    PublishReceived,
    PublishRelease,
    PublishComplete,
    Subscribe,
    SubscribeAck,
    Unsubscribe,
    UnsubscribeAck,
    PingRequest,
    PingResponse,
    Disconnect,
}

impl PacketType {
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        let type_bits = match packet_type {
            PacketType::Connect => 1,
            PacketType::ConnectAck => 2,
            PacketType::Publish { .. } => 3,
            PacketType::PublishAck => 4,
            PacketType::PublishReceived => 5,
            PacketType::PublishRelease => 6,
            PacketType::PublishComplete => 7,
            PacketType::Subscribe => 8,
            PacketType::SubscribeAck => 9,
            PacketType::Unsubscribe => 10,
            PacketType::UnsubscribeAck => 11,
            PacketType::PingRequest => 12,
            PacketType::PingResponse => 13,
            PacketType::Disconnect => 14,
        };

        let flag_bits = match packet_type {
            PacketType::Publish { dup, qos, retain } => {
                let dup = if dup { 0b0000_1000 } else { 0 };
                let qos = match qos {
                    QoS::AtMostOnce => 0b0000_0000,
                    QoS::AtLeastOnce => 0b0000_0010,
                    QoS::ExactlyOnce => 0b0000_0100,
                };
                let retain = if retain { 0b0000_0001 } else { 0 };
                dup | qos | retain
            }
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => {
                // Reserved bits, fixed to 0b0010 by the protocol.
                0b0000_0010
            }
            _ => 0,
        };

        (type_bits << 4) | flag_bits
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    /// # Errors
    /// Returns `InvalidPacketType` for an unrecognised type nibble, or
    /// `InvalidPacketFlags` when the flag bits don't match the fixed value the
    /// protocol mandates for that type.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let type_bits = (v & 0b1111_0000) >> 4;
        let flag = v & 0b0000_1111;

        match type_bits {
            1 if flag == 0 => Ok(Self::Connect),
            2 if flag == 0 => Ok(Self::ConnectAck),
            3 => {
                let dup = flag & 0b0000_1000 != 0;
                let retain = flag & 0b0000_0001 != 0;
                let qos = match flag & 0b0000_0110 {
                    0b0000_0000 => QoS::AtMostOnce,
                    0b0000_0010 => QoS::AtLeastOnce,
                    0b0000_0100 => QoS::ExactlyOnce,
                    _ => return Err(DecodeError::InvalidPacketFlags),
                };
                if dup && qos == QoS::AtMostOnce {
                    return Err(DecodeError::InvalidPacketFlags);
                }
                Ok(Self::Publish { dup, qos, retain })
            }
            4 if flag == 0 => Ok(Self::PublishAck),
            5 if flag == 0 => Ok(Self::PublishReceived),
            6 if flag == 0b0000_0010 => Ok(Self::PublishRelease),
            7 if flag == 0 => Ok(Self::PublishComplete),
            8 if flag == 0b0000_0010 => Ok(Self::Subscribe),
            9 if flag == 0 => Ok(Self::SubscribeAck),
            10 if flag == 0b0000_0010 => Ok(Self::Unsubscribe),
            11 if flag == 0 => Ok(Self::UnsubscribeAck),
            12 if flag == 0 => Ok(Self::PingRequest),
            13 if flag == 0 => Ok(Self::PingResponse),
            14 if flag == 0 => Ok(Self::Disconnect),
            1..=14 => {
                log::error!("header: invalid flags {flag:#06b} for type {type_bits}");
                Err(DecodeError::InvalidPacketFlags)
            }
            _ => {
                log::error!("header: invalid packet type bits {type_bits:#06b}");
                Err(DecodeError::InvalidPacketType)
            }
        }
    }
}

/// Fixed header shared by every control packet: one type/flags byte followed by a
/// variable length `Remaining Length` field.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct FixedHeader {
    packet_type: PacketType,
    remaining_length: VarInt,
}

impl FixedHeader {
    /// # Errors
    /// Returns error if `remaining_length` exceeds the protocol's four-byte limit.
    pub fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, EncodeError> {
        Ok(Self {
            packet_type,
            remaining_length: VarInt::from(remaining_length)?,
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub const fn remaining_length(&self) -> usize {
        self.remaining_length.value()
    }

    #[must_use]
    pub const fn bytes(&self) -> usize {
        PacketType::bytes() + self.remaining_length.bytes()
    }
}

impl DecodePacket for FixedHeader {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flag = ba.read_byte()?;
        let packet_type = PacketType::try_from(flag)?;
        let remaining_length = VarInt::decode(ba)?;
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }
}

impl EncodePacket for FixedHeader {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(self.packet_type.into());
        let len_bytes = self.remaining_length.encode(buf)?;
        Ok(PacketType::bytes() + len_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_publish_header() {
        let header = FixedHeader::new(
            PacketType::Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: true,
            },
            19,
        )
        .unwrap();
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = FixedHeader::decode(&mut ba).unwrap();
        assert_eq!(
            decoded.packet_type(),
            PacketType::Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: true,
            }
        );
        assert_eq!(decoded.remaining_length(), 19);
    }

    #[test]
    fn rejects_reserved_flags() {
        assert!(PacketType::try_from(0b0001_0001).is_err());
    }

    #[test]
    fn rejects_bad_subscribe_flags() {
        assert!(PacketType::try_from(0b1000_0000).is_err());
    }

    #[test]
    fn rejects_dup_flag_on_qos_zero_publish() {
        // type nibble 3 (PUBLISH), dup=1, qos=0, retain=0.
        assert_eq!(PacketType::try_from(0b0011_1000), Err(DecodeError::InvalidPacketFlags));
    }
}
