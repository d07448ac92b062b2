// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};

use crate::base::{DecodePacket, EncodePacket, QoS};
use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::header::{FixedHeader, PacketType};

const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level requested by a CONNECT packet.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ProtocolLevel {
    V31 = 3,
    #[default]
    V311 = 4,
}

impl TryFrom<u8> for ProtocolLevel {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            3 => Ok(Self::V31),
            4 => Ok(Self::V311),
            _ => Err(DecodeError::InvalidProtocolLevel),
        }
    }
}

/// Structure of `ConnectFlags`:
/// ```txt
///         7               6              5          4-3          2            1             0
/// +---------------+---------------+-------------+----------+-----------+---------------+----------+
/// | Username Flag | Password Flag | Will Retain | Will QoS | Will Flag | Clean Session | Reserved |
/// +---------------+---------------+-------------+----------+-----------+---------------+----------+
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ConnectFlags {
    pub username: bool,
    pub password: bool,
    pub will_retain: bool,
    pub will_qos: QoS,
    pub will: bool,
    pub clean_session: bool,
}

impl DecodePacket for ConnectFlags {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flags = ba.read_byte()?;
        if flags & 0b0000_0001 != 0 {
            return Err(DecodeError::InvalidConnectFlags);
        }
        let username = flags & 0b1000_0000 != 0;
        let password = flags & 0b0100_0000 != 0;
        let will_retain = flags & 0b0010_0000 != 0;
        let will_qos = QoS::try_from((flags & 0b0001_1000) >> 3)?;
        let will = flags & 0b0000_0100 != 0;
        let clean_session = flags & 0b0000_0010 != 0;

        if !will && (will_retain || will_qos != QoS::AtMostOnce) {
            return Err(DecodeError::InvalidConnectFlags);
        }
        if !username && password {
            return Err(DecodeError::InvalidConnectFlags);
        }

        Ok(Self {
            username,
            password,
            will_retain,
            will_qos,
            will,
            clean_session,
        })
    }
}

impl EncodePacket for ConnectFlags {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let username = if self.username { 0b1000_0000 } else { 0 };
        let password = if self.password { 0b0100_0000 } else { 0 };
        let will_retain = if self.will_retain { 0b0010_0000 } else { 0 };
        let will_qos = (self.will_qos as u8) << 3;
        let will = if self.will { 0b0000_0100 } else { 0 };
        let clean_session = if self.clean_session { 0b0000_0010 } else { 0 };
        buf.push(username | password | will_retain | will_qos | will | clean_session);
        Ok(1)
    }
}

/// Request to open a new MQTT session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectPacket {
    pub protocol_level: ProtocolLevel,
    pub connect_flags: ConnectFlags,
    pub keep_alive: u16,
    client_id: String,
    will_topic: String,
    will_message: Vec<u8>,
    username: String,
    password: Vec<u8>,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: &str, keep_alive: u16) -> Self {
        Self {
            client_id: client_id.to_string(),
            keep_alive,
            connect_flags: ConnectFlags {
                clean_session: true,
                ..ConnectFlags::default()
            },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_username(&mut self, username: &str) {
        self.connect_flags.username = true;
        self.username = username.to_string();
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.connect_flags.username.then_some(self.username.as_str())
    }

    pub fn set_password(&mut self, password: &[u8]) {
        self.connect_flags.password = true;
        self.password = password.to_vec();
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.connect_flags.password.then_some(self.password.as_slice())
    }

    pub fn set_will(&mut self, topic: &str, message: &[u8], qos: QoS, retain: bool) {
        self.connect_flags.will = true;
        self.connect_flags.will_qos = qos;
        self.connect_flags.will_retain = retain;
        self.will_topic = topic.to_string();
        self.will_message = message.to_vec();
    }

    #[must_use]
    pub fn will(&self) -> Option<(&str, &[u8])> {
        self.connect_flags
            .will
            .then_some((self.will_topic.as_str(), self.will_message.as_slice()))
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name_len = ba.read_u16()? as usize;
        let protocol_name = ba.read_string(protocol_name_len)?;
        if protocol_name != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }

        let protocol_level = ProtocolLevel::try_from(ba.read_byte()?)?;
        let connect_flags = ConnectFlags::decode(ba)?;
        let keep_alive = ba.read_u16()?;

        let client_id_len = ba.read_u16()? as usize;
        let client_id = ba.read_string(client_id_len)?;

        let (will_topic, will_message) = if connect_flags.will {
            let topic_len = ba.read_u16()? as usize;
            let topic = ba.read_string(topic_len)?;
            let message_len = ba.read_u16()? as usize;
            let message = ba.read_bytes(message_len)?.to_vec();
            (topic, message)
        } else {
            (String::new(), Vec::new())
        };

        let username = if connect_flags.username {
            let len = ba.read_u16()? as usize;
            ba.read_string(len)?
        } else {
            String::new()
        };

        let password = if connect_flags.password {
            let len = ba.read_u16()? as usize;
            ba.read_bytes(len)?.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            protocol_level,
            connect_flags,
            keep_alive,
            client_id,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let mut remaining_length = 2
            + PROTOCOL_NAME.len()
            + 1 // protocol level
            + 1 // connect flags
            + 2 // keep alive
            + 2
            + self.client_id.len();

        if self.connect_flags.will {
            remaining_length += 2 + self.will_topic.len();
            remaining_length += 2 + self.will_message.len();
        }
        if self.connect_flags.username {
            remaining_length += 2 + self.username.len();
        }
        if self.connect_flags.password {
            remaining_length += 2 + self.password.len();
        }

        let fixed_header = FixedHeader::new(PacketType::Connect, remaining_length)?;
        fixed_header.encode(buf)?;

        buf.write_u16::<BigEndian>(PROTOCOL_NAME.len() as u16)?;
        buf.write_all(PROTOCOL_NAME.as_bytes())?;
        buf.push(self.protocol_level as u8);
        self.connect_flags.encode(buf)?;
        buf.write_u16::<BigEndian>(self.keep_alive)?;

        write_string(buf, &self.client_id)?;
        if self.connect_flags.will {
            write_string(buf, &self.will_topic)?;
            write_bytes(buf, &self.will_message)?;
        }
        if self.connect_flags.username {
            write_string(buf, &self.username)?;
        }
        if self.connect_flags.password {
            write_bytes(buf, &self.password)?;
        }

        Ok(buf.len() - old_len)
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    if s.len() > usize::from(u16::MAX) {
        return Err(EncodeError::TooManyData);
    }
    buf.write_u16::<BigEndian>(s.len() as u16)?;
    buf.write_all(s.as_bytes())?;
    Ok(())
}

fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > usize::from(u16::MAX) {
        return Err(EncodeError::TooManyData);
    }
    buf.write_u16::<BigEndian>(data.len() as u16)?;
    buf.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_minimal() {
        let packet = ConnectPacket::new("client-1", 60);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.client_id(), "client-1");
        assert_eq!(decoded.keep_alive, 60);
    }

    #[test]
    fn round_trip_with_credentials() {
        let mut packet = ConnectPacket::new("client-2", 30);
        packet.set_username("alice");
        packet.set_password(b"secret");
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.username(), Some("alice"));
        assert_eq!(decoded.password(), Some(b"secret".as_slice()));
    }
}
