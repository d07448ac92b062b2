// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{ConnectAckPacket, ConnectPacket, PublishPacket, SubscribeAckPacket, SubscribePacket, UnsubscribePacket};

use crate::types::SessionId;

/// Sent by a `Session` task to the broker core when a client sends a control packet.
#[derive(Debug, Clone)]
pub enum SessionToListenerCmd {
    Connect(SessionId, ConnectPacket),
    Publish(SessionId, PublishPacket),
    Subscribe(SessionId, SubscribePacket),
    Unsubscribe(SessionId, UnsubscribePacket),
    Disconnect(SessionId),
}

/// Sent by the broker core to a `Session` task to push a packet out to its client,
/// or to force the connection closed (e.g. on take-over).
#[derive(Debug, Clone)]
pub enum ListenerToSessionCmd {
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    SubscribeAck(SubscribeAckPacket),
    UnsubscribeAck(codec::UnsubscribeAckPacket),
    Disconnect,
}

/// Sent by the scheduler to the broker core to publish a sampled telemetry payload.
#[derive(Debug, Clone)]
pub struct SchedulerToListenerCmd {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: codec::QoS,
    pub retain: bool,
}
