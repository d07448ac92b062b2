// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodeError, DecodePacket,
    DisconnectPacket, EncodePacket, FixedHeader, PacketId, PacketType, PingRequestPacket,
    PingResponsePacket, PublishAckPacket, PublishPacket, QoS, SubscribeAck, SubscribeAckPacket,
    SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::interval;

use crate::commands::{ListenerToSessionCmd, SessionToListenerCmd};
use crate::error::Error;
use crate::types::SessionId;

const RESEND_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const RESEND_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESENDS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

struct PendingAck {
    packet: PublishPacket,
    sent_at: Instant,
    resends: u32,
}

/// Owns one accepted TCP connection and the MQTT protocol state that goes with it.
///
/// A `Session` never touches the subscription index or the retained-message store
/// directly; it only decodes packets off the wire and forwards intents to the
/// broker core, and encodes packets the broker core asks it to deliver.
pub struct Session {
    id: SessionId,
    stream: TcpStream,
    state: SessionState,
    client_id: String,
    keep_alive_threshold: Option<Duration>,
    last_activity: Instant,
    next_packet_id: PacketId,
    pending_acks: HashMap<PacketId, PendingAck>,

    sender: Sender<SessionToListenerCmd>,
    receiver: Receiver<ListenerToSessionCmd>,
}

impl Session {
    #[must_use]
    pub fn new(
        id: SessionId,
        stream: TcpStream,
        sender: Sender<SessionToListenerCmd>,
        receiver: Receiver<ListenerToSessionCmd>,
    ) -> Self {
        Self {
            id,
            stream,
            state: SessionState::Connecting,
            client_id: String::new(),
            keep_alive_threshold: None,
            last_activity: Instant::now(),
            next_packet_id: 1,
            pending_acks: HashMap::new(),
            sender,
            receiver,
        }
    }

    fn next_id(&mut self) -> PacketId {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }

    pub async fn run_loop(mut self) {
        let mut buf = Vec::with_capacity(1024);
        let mut resend_tick = interval(RESEND_CHECK_INTERVAL);

        loop {
            if self.state == SessionState::Closed {
                break;
            }

            tokio::select! {
                result = self.stream.read_buf(&mut buf) => {
                    match result {
                        Ok(0) => {
                            log::info!("session {}: peer closed connection", self.id);
                            break;
                        }
                        Ok(_n) => {
                            if let Err(err) = self.drain_buffer(&mut buf).await {
                                log::error!("session {}: protocol error: {err:?}", self.id);
                                self.close_connection().await;
                                break;
                            }
                        }
                        Err(err) => {
                            log::warn!("session {}: read error: {err:?}", self.id);
                            break;
                        }
                    }
                }
                Some(cmd) = self.receiver.recv() => {
                    if let Err(err) = self.handle_listener_cmd(cmd).await {
                        log::error!("session {}: failed to forward packet: {err:?}", self.id);
                        break;
                    }
                    if self.state == SessionState::Closed {
                        break;
                    }
                }
                _ = resend_tick.tick() => {
                    if let Err(err) = self.resend_unacked().await {
                        log::error!("session {}: resend failed: {err:?}", self.id);
                        break;
                    }
                }
            }

            if let Some(threshold) = self.keep_alive_threshold {
                if self.last_activity.elapsed() > threshold {
                    log::warn!("session {}: keep-alive window exceeded, disconnecting", self.id);
                    self.close_connection().await;
                    break;
                }
            }
        }

        let _ = self.sender.send(SessionToListenerCmd::Disconnect(self.id)).await;
    }

    /// Decode and dispatch every complete packet currently sitting at the front of
    /// `buf`, then drop just the bytes that were consumed. Leftover bytes (a
    /// partial packet) stay in `buf` for the next read.
    async fn drain_buffer(&mut self, buf: &mut Vec<u8>) -> Result<(), Error> {
        loop {
            let mut ba = ByteArray::new(buf);
            let header = match FixedHeader::decode(&mut ba) {
                Ok(header) => header,
                Err(DecodeError::NeedMore) => return Ok(()),
                Err(err) => return Err(err.into()),
            };

            let total_len = header.bytes() + header.remaining_length();
            if buf.len() < total_len {
                return Ok(());
            }

            let packet_type = header.packet_type();
            let frame = buf[..total_len].to_vec();
            buf.drain(..total_len);

            self.last_activity = Instant::now();
            self.dispatch_packet(packet_type, &frame).await?;
        }
    }

    async fn dispatch_packet(&mut self, packet_type: PacketType, frame: &[u8]) -> Result<(), Error> {
        match packet_type {
            PacketType::Connect => self.on_connect(frame).await,
            PacketType::PingRequest => self.on_ping(frame).await,
            PacketType::Publish { .. } => self.on_publish(frame).await,
            PacketType::PublishAck => self.on_publish_ack(frame).await,
            PacketType::Subscribe => self.on_subscribe(frame).await,
            PacketType::Unsubscribe => self.on_unsubscribe(frame).await,
            PacketType::Disconnect => self.on_disconnect(frame).await,
            PacketType::PublishReceived | PacketType::PublishRelease | PacketType::PublishComplete => {
                Err(Error::new(
                    crate::error::ErrorKind::ProtocolError,
                    "QoS 2 is not supported",
                ))
            }
            other => {
                log::warn!("session {}: unexpected packet type {other:?} from client", self.id);
                Ok(())
            }
        }
    }

    async fn send<P: EncodePacket>(&mut self, packet: P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        tokio::io::AsyncWriteExt::write_all(&mut self.stream, &buf).await?;
        Ok(())
    }

    /// MQTT 3.1.1 DISCONNECT is client→server only; the broker has no packet to
    /// signal a forced close, so it just shuts the socket down. A subsequent
    /// write or read on the peer's end observes this as a closed connection.
    async fn close_connection(&mut self) {
        self.state = SessionState::Disconnecting;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut self.stream).await;
        self.state = SessionState::Closed;
    }

    async fn on_connect(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = match ConnectPacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(DecodeError::InvalidProtocolName | DecodeError::InvalidProtocolLevel) => {
                self.send(ConnectAckPacket::new(false, ConnectReturnCode::UnacceptedProtocol))
                    .await?;
                self.state = SessionState::Closed;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if self.state != SessionState::Connecting {
            self.close_connection().await;
            return Ok(());
        }

        self.client_id = if packet.client_id().is_empty() {
            codec::utils::random_client_id()
        } else {
            packet.client_id().to_string()
        };
        self.keep_alive_threshold = (packet.keep_alive > 0)
            .then(|| Duration::from_secs_f64(f64::from(packet.keep_alive) * 1.5));

        self.sender
            .send(SessionToListenerCmd::Connect(self.id, packet))
            .await
            .map(drop)?;
        Ok(())
    }

    async fn on_ping(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        PingRequestPacket::decode(&mut ba)?;
        self.send(PingResponsePacket).await
    }

    async fn on_publish(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = PublishPacket::decode(&mut ba)?;

        if packet.qos() == QoS::ExactlyOnce {
            return Err(Error::new(crate::error::ErrorKind::ProtocolError, "QoS 2 is not supported"));
        }

        // Routing is handed to the broker core before the PUBACK goes out, so a
        // client never observes an acknowledged message that was silently dropped.
        let packet_id = packet.packet_id();
        let qos = packet.qos();
        self.sender.send(SessionToListenerCmd::Publish(self.id, packet)).await.map(drop)?;

        if qos == QoS::AtLeastOnce {
            if let Some(packet_id) = packet_id {
                self.send(PublishAckPacket::new(packet_id)).await?;
            }
        }
        Ok(())
    }

    async fn on_publish_ack(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = PublishAckPacket::decode(&mut ba)?;
        self.pending_acks.remove(&packet.packet_id());
        Ok(())
    }

    async fn on_subscribe(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = SubscribePacket::decode(&mut ba)?;
        if self.sender.send(SessionToListenerCmd::Subscribe(self.id, packet.clone())).await.is_err() {
            let acks = packet.topics().iter().map(|_| SubscribeAck::Failed).collect();
            self.send(SubscribeAckPacket::new(packet.packet_id(), acks)).await?;
        }
        Ok(())
    }

    async fn on_unsubscribe(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = UnsubscribePacket::decode(&mut ba)?;
        let packet_id = packet.packet_id();
        let _ = self.sender.send(SessionToListenerCmd::Unsubscribe(self.id, packet)).await;
        self.send(UnsubscribeAckPacket::new(packet_id)).await
    }

    async fn on_disconnect(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        DisconnectPacket::decode(&mut ba)?;
        self.state = SessionState::Closed;
        Ok(())
    }

    async fn handle_listener_cmd(&mut self, cmd: ListenerToSessionCmd) -> Result<(), Error> {
        match cmd {
            ListenerToSessionCmd::ConnectAck(packet) => {
                self.state = if packet.return_code() == ConnectReturnCode::Accepted {
                    SessionState::Connected
                } else {
                    SessionState::Closed
                };
                self.send(packet).await
            }
            ListenerToSessionCmd::Publish(mut packet) => {
                if packet.qos() == QoS::AtLeastOnce {
                    // This session owns its own packet-id namespace: whatever id the
                    // broker core attached (if any) is discarded and replaced so
                    // in-flight bookkeeping never collides across publishes.
                    let id = self.next_id();
                    packet = PublishPacket::new(
                        packet.topic().clone(),
                        packet.qos(),
                        packet.payload().to_vec(),
                        packet.retain(),
                        Some(id),
                    )?;
                    self.pending_acks.insert(
                        id,
                        PendingAck { packet: packet.clone(), sent_at: Instant::now(), resends: 0 },
                    );
                }
                self.send(packet).await
            }
            ListenerToSessionCmd::SubscribeAck(packet) => self.send(packet).await,
            ListenerToSessionCmd::UnsubscribeAck(packet) => self.send(packet).await,
            ListenerToSessionCmd::Disconnect => {
                self.close_connection().await;
                Ok(())
            }
        }
    }

    async fn resend_unacked(&mut self) -> Result<(), Error> {
        let expired: Vec<PacketId> = self
            .pending_acks
            .iter()
            .filter(|(_, pending)| pending.sent_at.elapsed() > RESEND_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();

        for packet_id in expired {
            let Some(pending) = self.pending_acks.get_mut(&packet_id) else { continue };
            if pending.resends >= MAX_RESENDS {
                log::warn!("session {}: giving up on packet {packet_id} after {MAX_RESENDS} resends", self.id);
                self.pending_acks.remove(&packet_id);
                continue;
            }
            let mut packet = pending.packet.clone();
            packet.set_dup(true);
            pending.resends += 1;
            pending.sent_at = Instant::now();
            self.send(packet).await?;
        }
        Ok(())
    }
}
