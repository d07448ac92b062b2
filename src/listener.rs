// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::time::Duration;

use codec::{
    utils, ConnectAckPacket, ConnectPacket, ConnectReturnCode, PublishPacket, QoS, SubscribeAck,
    SubscribeAckPacket, SubscribePacket, Topic, UnsubscribePacket,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::commands::{ListenerToSessionCmd, SchedulerToListenerCmd, SessionToListenerCmd};
use crate::error::{Error, ErrorKind};
use crate::router::TopicRouter;
use crate::session::Session;
use crate::types::SessionId;

pub const CHANNEL_CAPACITY: usize = 16;

/// How long publishing to a QoS-1 subscriber may block before it is treated as a
/// slow consumer and disconnected.
const SLOW_CONSUMER_DEADLINE: Duration = Duration::from_millis(500);

struct SessionHandle {
    sender: Sender<ListenerToSessionCmd>,
    client_id: String,
}

/// Owns the accept loop, every connected [`Session`]'s outbound channel, and the
/// [`TopicRouter`]. Runs on a single task: all mutation of subscription and
/// session-registry state happens here, so nothing in this module needs a lock.
pub struct Listener {
    tcp_listener: TcpListener,
    credentials: Option<(String, String)>,

    router: TopicRouter,
    sessions: HashMap<SessionId, SessionHandle>,
    client_ids: HashMap<String, SessionId>,
    next_session_id: SessionId,

    session_sender: Sender<SessionToListenerCmd>,
    session_receiver: Receiver<SessionToListenerCmd>,
    scheduler_receiver: Receiver<SchedulerToListenerCmd>,
}

impl Listener {
    /// # Errors
    /// Returns `BindError` if the address cannot be bound.
    pub async fn bind(
        addr: &str,
        credentials: Option<(String, String)>,
        scheduler_receiver: Receiver<SchedulerToListenerCmd>,
    ) -> Result<Self, Error> {
        let tcp_listener = TcpListener::bind(addr).await.map_err(|err| {
            Error::from_string(ErrorKind::BindError, format!("failed to bind {addr}: {err}"))
        })?;
        log::info!("listener: bound mqtt://{addr}");

        let (session_sender, session_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        Ok(Self {
            tcp_listener,
            credentials,
            router: TopicRouter::new(),
            sessions: HashMap::new(),
            client_ids: HashMap::new(),
            next_session_id: 0,
            session_sender,
            session_receiver,
            scheduler_receiver,
        })
    }

    /// # Errors
    /// Returns an I/O error if the underlying socket has already been shut down.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.tcp_listener.local_addr()
    }

    pub async fn run_loop(mut self) -> ! {
        loop {
            tokio::select! {
                accepted = self.tcp_listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::info!("listener: accepted connection from {peer}");
                            self.new_connection(stream);
                        }
                        Err(err) => log::warn!("listener: accept failed: {err}"),
                    }
                }

                Some(cmd) = self.session_receiver.recv() => {
                    if let Err(err) = self.handle_session_cmd(cmd).await {
                        log::error!("listener: failed to handle session command: {err}");
                    }
                }

                Some(cmd) = self.scheduler_receiver.recv() => {
                    if let Err(err) = self.on_publish(&cmd.topic, cmd.payload, cmd.qos, cmd.retain).await {
                        log::error!("listener: failed to publish scheduled sample: {err}");
                    }
                }
            }
        }
    }

    fn next_session_id(&mut self) -> SessionId {
        self.next_session_id += 1;
        self.next_session_id
    }

    fn new_connection(&mut self, stream: tokio::net::TcpStream) {
        let session_id = self.next_session_id();
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        self.sessions.insert(
            session_id,
            SessionHandle { sender, client_id: String::new() },
        );
        let session = Session::new(session_id, stream, self.session_sender.clone(), receiver);
        tokio::spawn(session.run_loop());
    }

    async fn handle_session_cmd(&mut self, cmd: SessionToListenerCmd) -> Result<(), Error> {
        match cmd {
            SessionToListenerCmd::Connect(session_id, packet) => {
                self.on_session_connect(session_id, packet).await
            }
            SessionToListenerCmd::Publish(_session_id, packet) => {
                let qos = packet.qos();
                let retain = packet.retain();
                let topic = packet.topic().as_str().to_string();
                self.on_publish(&topic, packet.payload().to_vec(), qos, retain).await
            }
            SessionToListenerCmd::Subscribe(session_id, packet) => {
                self.on_session_subscribe(session_id, packet).await
            }
            SessionToListenerCmd::Unsubscribe(session_id, packet) => {
                self.on_session_unsubscribe(session_id, packet);
                Ok(())
            }
            SessionToListenerCmd::Disconnect(session_id) => {
                self.on_session_disconnect(session_id);
                Ok(())
            }
        }
    }

    /// A new CONNECT with a client id already in use forcibly closes the prior
    /// session before the new one is accepted, rather than rejecting the new one.
    async fn on_session_connect(
        &mut self,
        session_id: SessionId,
        packet: ConnectPacket,
    ) -> Result<(), Error> {
        if packet.client_id().is_empty() && !packet.connect_flags.clean_session {
            return self
                .send_to_session(
                    session_id,
                    ListenerToSessionCmd::ConnectAck(ConnectAckPacket::new(
                        false,
                        ConnectReturnCode::IdentifierRejected,
                    )),
                )
                .await;
        }

        if let Some((user, pass)) = &self.credentials {
            let given_user = packet.username();
            let given_pass = packet.password();
            if given_user != Some(user.as_str()) || given_pass != Some(pass.as_bytes()) {
                return self
                    .send_to_session(
                        session_id,
                        ListenerToSessionCmd::ConnectAck(ConnectAckPacket::new(
                            false,
                            ConnectReturnCode::NotAuthorized,
                        )),
                    )
                    .await;
            }
        }

        let client_id = if packet.client_id().is_empty() {
            utils::random_client_id()
        } else {
            packet.client_id().to_string()
        };

        if let Some(&old_session_id) = self.client_ids.get(&client_id) {
            if old_session_id != session_id {
                log::info!("listener: client id {client_id} takes over session {old_session_id}");
                self.close_session(old_session_id).await;
            }
        }

        self.client_ids.insert(client_id.clone(), session_id);
        if let Some(handle) = self.sessions.get_mut(&session_id) {
            handle.client_id = client_id;
        }

        self.send_to_session(
            session_id,
            ListenerToSessionCmd::ConnectAck(ConnectAckPacket::new(false, ConnectReturnCode::Accepted)),
        )
        .await
    }

    async fn on_session_subscribe(
        &mut self,
        session_id: SessionId,
        packet: SubscribePacket,
    ) -> Result<(), Error> {
        let mut acks = Vec::with_capacity(packet.topics().len());
        let mut retained_deliveries = Vec::new();
        for sub in packet.topics() {
            self.router.subscribe(session_id, sub.filter.clone(), sub.qos);
            acks.push(SubscribeAck::Granted(sub.qos));
            retained_deliveries.extend(self.router.retained_matching(&sub.filter));
        }

        self.send_to_session(
            session_id,
            ListenerToSessionCmd::SubscribeAck(SubscribeAckPacket::new(packet.packet_id(), acks)),
        )
        .await?;

        for (topic, payload, qos) in retained_deliveries {
            let packet_id = (qos == QoS::AtLeastOnce).then_some(1);
            let out = PublishPacket::new(topic, qos, payload, true, packet_id)?;
            self.deliver(session_id, out, qos).await;
        }
        Ok(())
    }

    fn on_session_unsubscribe(&mut self, session_id: SessionId, packet: UnsubscribePacket) {
        for filter in packet.topics() {
            self.router.unsubscribe(session_id, filter);
        }
    }

    fn on_session_disconnect(&mut self, session_id: SessionId) {
        if let Some(handle) = self.sessions.remove(&session_id) {
            self.client_ids.remove(&handle.client_id);
        }
        self.router.remove_session(session_id);
    }

    async fn close_session(&mut self, session_id: SessionId) {
        if let Some(handle) = self.sessions.remove(&session_id) {
            self.client_ids.remove(&handle.client_id);
            let _ = handle.sender.try_send(ListenerToSessionCmd::Disconnect);
        }
        self.router.remove_session(session_id);
    }

    /// Deliver a publish (from a session or the scheduler) to every matching
    /// subscriber, applying and storing retained state first.
    ///
    /// # Errors
    /// Returns `ProtocolError` if `topic_str` is not a valid publish topic, or
    /// `EncodeError`-derived errors bubbled up from packet construction.
    async fn on_publish(
        &mut self,
        topic_str: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        let topic = Topic::parse(topic_str)?;
        if retain {
            self.router.store_retained(&topic, payload.clone(), qos);
        }

        for (session_id, granted_qos) in self.router.matching(&topic) {
            let effective_qos = if (qos as u8) < (granted_qos as u8) { qos } else { granted_qos };
            let packet_id = (effective_qos == QoS::AtLeastOnce).then_some(1);
            let out = PublishPacket::new(topic.clone(), effective_qos, payload.clone(), false, packet_id)?;
            self.deliver(session_id, out, effective_qos).await;
        }
        Ok(())
    }

    /// QoS-0 subscribers that cannot keep up are disconnected immediately rather
    /// than applying backpressure; QoS-1 subscribers get a short grace window
    /// before the same fate.
    async fn deliver(&mut self, session_id: SessionId, packet: PublishPacket, qos: QoS) {
        let Some(handle) = self.sessions.get(&session_id) else { return };
        let cmd = ListenerToSessionCmd::Publish(packet);

        let outcome = match qos {
            QoS::AtMostOnce => handle.sender.try_send(cmd).map_err(|err| match err {
                TrySendError::Full(_) => "outbound queue full",
                TrySendError::Closed(_) => "session gone",
            }),
            _ => match tokio::time::timeout(SLOW_CONSUMER_DEADLINE, handle.sender.send(cmd)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err("session gone"),
                Err(_) => Err("slow consumer deadline exceeded"),
            },
        };

        if let Err(reason) = outcome {
            log::warn!("listener: dropping slow consumer session {session_id}: {reason}");
            self.close_session(session_id).await;
        }
    }

    async fn send_to_session(&mut self, session_id: SessionId, cmd: ListenerToSessionCmd) -> Result<(), Error> {
        if let Some(handle) = self.sessions.get(&session_id) {
            handle.sender.send(cmd).await.map_err(Into::into)
        } else {
            Ok(())
        }
    }
}
