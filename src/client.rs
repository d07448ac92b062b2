// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::time::Duration;

use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodeError, DecodePacket,
    EncodePacket, FixedHeader, PacketType, PingRequestPacket, PingResponsePacket, PublishAckPacket,
    PublishPacket, QoS, Topic,
};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::Receiver;
use tokio::time::interval;

use crate::commands::SchedulerToListenerCmd;
use crate::config::mqtt::Mqtt;
use crate::error::Error;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const PUBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Speaks MQTT to a remote broker on behalf of the scheduler, reconnecting with
/// exponential backoff whenever the connection drops.
pub struct ExternalClient {
    config: Mqtt,
    receiver: Receiver<SchedulerToListenerCmd>,
}

impl ExternalClient {
    #[must_use]
    pub fn new(config: Mqtt, receiver: Receiver<SchedulerToListenerCmd>) -> Self {
        Self { config, receiver }
    }

    pub async fn run_loop(mut self) {
        let mut backoff = MIN_BACKOFF;
        loop {
            match self.connect_and_run().await {
                Ok(()) => backoff = MIN_BACKOFF,
                Err(err) => {
                    log::warn!(
                        "external client: connection to {}:{} failed: {err}",
                        self.config.host, self.config.port
                    );
                    let jitter = rand::thread_rng().gen_range(0.0..0.3);
                    let sleep_for = backoff.mul_f64(1.0 + jitter);
                    tokio::time::sleep(sleep_for).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_and_run(&mut self) -> Result<(), Error> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let mut stream = TcpStream::connect(&addr).await?;
        log::info!("external client: connected to {addr}");

        let mut connect = ConnectPacket::new(&self.config.client_id, self.config.keep_alive);
        if let Some(username) = &self.config.username {
            connect.set_username(username);
        }
        if let Some(password) = &self.config.password {
            connect.set_password(password.as_bytes());
        }
        write_packet(&mut stream, connect).await?;

        let mut buf = Vec::with_capacity(256);
        let ack = read_packet(&mut stream, &mut buf, PacketType::ConnectAck).await?;
        let mut ba = ByteArray::new(&ack);
        let ack = ConnectAckPacket::decode(&mut ba)?;
        if ack.return_code() != ConnectReturnCode::Accepted {
            return Err(Error::new(
                crate::error::ErrorKind::AuthError,
                "broker rejected CONNECT",
            ));
        }

        let keep_alive = Duration::from_secs(u64::from(self.config.keep_alive.max(1)));
        let mut ping_tick = interval(keep_alive / 2);
        let mut next_packet_id: u16 = 1;

        loop {
            tokio::select! {
                Some(cmd) = self.receiver.recv() => {
                    self.publish_sample(&mut stream, cmd, &mut next_packet_id).await?;
                }
                _ = ping_tick.tick() => {
                    write_packet(&mut stream, PingRequestPacket).await?;
                    let mut pong_buf = Vec::with_capacity(8);
                    let frame = read_packet(&mut stream, &mut pong_buf, PacketType::PingResponse).await?;
                    let mut ba = ByteArray::new(&frame);
                    PingResponsePacket::decode(&mut ba)?;
                }
                else => return Ok(()),
            }
        }
    }

    async fn publish_sample(
        &mut self,
        stream: &mut TcpStream,
        cmd: SchedulerToListenerCmd,
        next_packet_id: &mut u16,
    ) -> Result<(), Error> {
        let topic = Topic::parse(&cmd.topic)?;
        let packet_id = (cmd.qos == QoS::AtLeastOnce).then(|| {
            let id = *next_packet_id;
            *next_packet_id = next_packet_id.wrapping_add(1).max(1);
            id
        });
        let packet = PublishPacket::new(topic, cmd.qos, cmd.payload, cmd.retain, packet_id)?;
        write_packet(stream, packet).await?;

        if cmd.qos == QoS::AtLeastOnce {
            let mut buf = Vec::with_capacity(16);
            let frame = tokio::time::timeout(
                PUBACK_TIMEOUT,
                read_packet(stream, &mut buf, PacketType::PublishAck),
            )
            .await
            .map_err(|_| Error::new(crate::error::ErrorKind::TransportError, "PUBACK timed out"))??;
            let mut ba = ByteArray::new(&frame);
            PublishAckPacket::decode(&mut ba)?;
        }
        Ok(())
    }
}

async fn write_packet<P: EncodePacket>(stream: &mut TcpStream, packet: P) -> Result<(), Error> {
    let mut buf = Vec::new();
    packet.encode(&mut buf)?;
    stream.write_all(&buf).await?;
    Ok(())
}

/// Read bytes off `stream` into `buf` until one full packet has arrived, then
/// return just that frame.
async fn read_packet(stream: &mut TcpStream, buf: &mut Vec<u8>, expected: PacketType) -> Result<Vec<u8>, Error> {
    loop {
        {
            let mut ba = ByteArray::new(buf);
            match FixedHeader::decode(&mut ba) {
                Ok(header) => {
                    let total_len = header.bytes() + header.remaining_length();
                    if buf.len() >= total_len {
                        if std::mem::discriminant(&header.packet_type()) != std::mem::discriminant(&expected) {
                            log::warn!(
                                "external client: expected {expected:?}, got {:?}",
                                header.packet_type()
                            );
                        }
                        let frame = buf[..total_len].to_vec();
                        buf.drain(..total_len);
                        return Ok(frame);
                    }
                }
                Err(DecodeError::NeedMore) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(Error::new(
                crate::error::ErrorKind::TransportError,
                "connection closed by broker",
            ));
        }
    }
}
