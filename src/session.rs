//! Role-agnostic session state machine.
//!
//! This module holds everything the client and broker roles share:
//! - the connection lifecycle (`Disconnected → Connecting → Connected →
//!   Disconnecting → Disconnected`),
//! - keep-alive bookkeeping driven by an external timer tick,
//! - the QoS 0/1/2 handshake engine both roles delegate to, and
//! - the [`PacketFlow`] trait: per-packet-type handler operations with an
//!   exhaustive dispatch over the decoded packet union.
//!
//! Processing a packet is a synchronous operation: the caller hands in a
//! decoded packet and receives the ordered packets to write, the
//! application-visible events, the broker fan-out legs, and an optional
//! terminate signal. The session never spawns timers or touches the
//! transport. Exactly one logical thread of control drives a session; the
//! state here is not safe under concurrent mutation.

use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::packet::{
    ConnAck, Connect, ConnectReturnCode, MqttPacket, PacketType, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, UnsubAck, Unsubscribe,
};
use crate::tracker::{NextAction, OutboundRequest, OutboundStage, PacketIdTracker};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection established.
    Disconnected,
    /// CONNECT sent (client) or received and under validation (broker).
    Connecting,
    /// The CONNECT/CONNACK exchange completed.
    Connected,
    /// Termination under way; no further packets are accepted.
    Disconnecting,
}

/// Which end of the connection this session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Connection initiator.
    Client,
    /// Connection acceptor.
    Broker,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    /// The peer sent DISCONNECT: clean termination.
    NormalDisconnect,
    /// No packet of any kind from the peer within 1.5x the keep-alive
    /// interval.
    KeepAliveExpired,
    /// The peer broke the protocol state machine.
    ProtocolViolation(String),
    /// The CONNECT handshake was refused.
    ConnectRefused(ConnectReturnCode),
    /// A newer connection with the same client identifier took over.
    TakenOver,
    /// The transport failed or was closed by the caller.
    TransportClosed,
}

impl TerminateReason {
    /// Whether this ending counts as abnormal. Abnormal endings fire the
    /// will message and, for persistent sessions, retain in-flight state.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, Self::NormalDisconnect)
    }
}

/// A message crossing the application-delivery boundary.
#[derive(Debug, Clone)]
pub struct ApplicationMessage {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// QoS it was published with.
    pub qos: QoS,
    /// Retain flag as published.
    pub retain: bool,
}

impl ApplicationMessage {
    /// Build from a received PUBLISH.
    pub fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

/// Per-filter subscribe result reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeGrant {
    /// The requested topic filter.
    pub topic_filter: String,
    /// Granted QoS, or `None` when the filter was refused.
    pub granted: Option<QoS>,
}

impl SubscribeGrant {
    /// Build from a filter and its SUBACK return code.
    pub fn new(topic_filter: impl Into<String>, code: SubscribeReturnCode) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            granted: code.granted_qos(),
        }
    }
}

/// Application-visible effects of processing one packet.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The CONNECT/CONNACK handshake completed.
    Connected {
        /// Whether the peer resumed a persistent session.
        session_present: bool,
    },
    /// The peer refused the connection.
    ConnectRefused(ConnectReturnCode),
    /// A message reached the application-delivery boundary.
    MessageReceived(ApplicationMessage),
    /// A QoS 1/2 publish finished its acknowledgment handshake.
    PublishCompleted {
        /// The released identifier.
        packet_id: u16,
        /// QoS of the completed publish.
        qos: QoS,
    },
    /// A SUBACK reported per-filter results.
    SubscribeCompleted {
        /// Identifier of the SUBSCRIBE request.
        packet_id: u16,
        /// Grant or refusal per requested filter, in request order.
        grants: Vec<SubscribeGrant>,
    },
    /// An UNSUBACK confirmed filter removal.
    UnsubscribeCompleted {
        /// Identifier of the UNSUBSCRIBE request.
        packet_id: u16,
        /// The removed filters.
        topics: Vec<String>,
    },
}

/// A fan-out leg for the registry to drive: hand `message` to the session
/// of `client_id`, which runs its own sender-side handshake at `qos`.
#[derive(Debug, Clone)]
pub struct ForwardPublish {
    /// Target subscriber.
    pub client_id: String,
    /// Effective QoS for this leg (publish QoS capped by the grant).
    pub qos: QoS,
    /// The message to forward.
    pub message: ApplicationMessage,
}

/// Result of handing one decoded packet or timer tick to a session.
///
/// `packets` must reach the transport in order; acknowledgment matching
/// depends on in-order delivery on the underlying stream.
#[derive(Debug, Clone, Default)]
pub struct PacketOutcome {
    /// Ordered outbound packets for this session's transport.
    pub packets: Vec<MqttPacket>,
    /// Application-visible events.
    pub events: Vec<SessionEvent>,
    /// Broker fan-out legs for the registry to drive.
    pub forwards: Vec<ForwardPublish>,
    /// Set when the session must be torn down.
    pub terminate: Option<TerminateReason>,
}

impl PacketOutcome {
    /// An outcome with nothing to do.
    pub fn none() -> Self {
        Self::default()
    }

    /// An outcome that responds with a single packet.
    pub fn respond(packet: MqttPacket) -> Self {
        Self {
            packets: vec![packet],
            ..Self::default()
        }
    }

    /// An outcome carrying a single event.
    pub fn event(event: SessionEvent) -> Self {
        Self {
            events: vec![event],
            ..Self::default()
        }
    }

    /// Attach a terminate signal.
    pub fn terminated(mut self, reason: TerminateReason) -> Self {
        self.terminate = Some(reason);
        self
    }
}

/// Receiver-side result of a PUBLISH, shared by both roles.
#[derive(Debug)]
pub(crate) enum ReceivedPublish {
    /// QoS 0/1: deliver now; `ack` carries the PUBACK for QoS 1.
    Deliver {
        message: ApplicationMessage,
        ack: Option<MqttPacket>,
    },
    /// QoS 2: registered (first receipt or duplicate); only PUBREC goes
    /// out, delivery waits for PUBREL.
    Recorded { ack: MqttPacket },
}

/// Shared per-session engine: identity, lifecycle, keep-alive clocks, and
/// the identifier tracker. Both role variants delegate here.
#[derive(Debug)]
pub struct SessionCore {
    client_id: String,
    role: SessionRole,
    state: ConnectionState,
    clean_session: bool,
    keep_alive: Duration,
    created_at: Instant,
    last_inbound: Instant,
    last_outbound: Instant,
    tracker: PacketIdTracker,
    terminated: Option<TerminateReason>,
}

impl SessionCore {
    pub(crate) fn new(
        client_id: impl Into<String>,
        role: SessionRole,
        clean_session: bool,
        keep_alive: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            client_id: client_id.into(),
            role,
            state: ConnectionState::Disconnected,
            clean_session,
            keep_alive,
            created_at: now,
            last_inbound: now,
            last_outbound: now,
            tracker: PacketIdTracker::new(),
            terminated: None,
        }
    }

    /// Client identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Endpoint role.
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the CONNECT/CONNACK exchange has completed.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Clean-session flag. A false value makes the session persistent:
    /// in-flight state survives an abnormal end.
    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Negotiated keep-alive interval. Zero disables keep-alive.
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// When the peer last sent any packet.
    pub fn last_inbound(&self) -> Instant {
        self.last_inbound
    }

    /// When this session last handed a packet to the transport.
    pub fn last_outbound(&self) -> Instant {
        self.last_outbound
    }

    /// Why the session ended, once it has.
    pub fn terminate_reason(&self) -> Option<&TerminateReason> {
        self.terminated.as_ref()
    }

    /// Outbound identifiers in flight.
    pub fn outbound_in_flight(&self) -> usize {
        self.tracker.outbound_len()
    }

    /// Inbound QoS 2 registrations.
    pub fn inbound_in_flight(&self) -> usize {
        self.tracker.inbound_len()
    }

    /// Outbound identifiers unacknowledged for at least `after` as of
    /// `now`. Retry policy belongs to the caller.
    pub fn stalled(&self, now: Instant, after: Duration) -> Vec<u16> {
        self.tracker.stalled(now, after)
    }

    /// Rebuild the retransmission packet for an in-flight identifier;
    /// `None` when it has been acknowledged in the meantime.
    pub fn retransmit(&mut self, packet_id: u16) -> Option<MqttPacket> {
        let packet = self.tracker.retransmit_packet(packet_id)?;
        self.note_outbound();
        Some(packet)
    }

    /// Adopt the identifier announced in CONNECT. Broker sessions start
    /// without one.
    pub(crate) fn set_client_id(&mut self, client_id: impl Into<String>) {
        self.client_id = client_id.into();
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        debug!(
            client_id = %self.client_id,
            from = ?self.state,
            to = ?state,
            "connection state transition"
        );
        self.state = state;
    }

    pub(crate) fn set_negotiated(&mut self, keep_alive: Duration, clean_session: bool) {
        self.keep_alive = keep_alive;
        self.clean_session = clean_session;
    }

    pub(crate) fn note_inbound(&mut self) {
        self.last_inbound = Instant::now();
    }

    pub(crate) fn note_outbound(&mut self) {
        self.last_outbound = Instant::now();
    }

    pub(crate) fn tracker(&self) -> &PacketIdTracker {
        &self.tracker
    }

    pub(crate) fn tracker_mut(&mut self) -> &mut PacketIdTracker {
        &mut self.tracker
    }

    pub(crate) fn take_tracker(&mut self) -> PacketIdTracker {
        std::mem::take(&mut self.tracker)
    }

    pub(crate) fn install_tracker(&mut self, tracker: PacketIdTracker) {
        self.tracker = tracker;
    }

    /// Record the reason and stop accepting packets; the caller still has
    /// to invoke [`terminate`](Self::terminate) once the transport is gone.
    pub(crate) fn begin_termination(&mut self, reason: TerminateReason) {
        if self.terminated.is_none() {
            self.terminated = Some(reason);
        }
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnecting;
        }
    }

    /// Finish the session. Idempotent: the second and later calls do
    /// nothing and return false, so callers can drive registry cleanup
    /// exactly once. A clean-session end discards all in-flight state; a
    /// persistent end keeps the tracker for resumption.
    pub fn terminate(&mut self, reason: TerminateReason) -> bool {
        if self.state == ConnectionState::Disconnected && self.terminated.is_some() {
            return false;
        }
        if self.terminated.is_none() {
            self.terminated = Some(reason);
        }
        self.state = ConnectionState::Disconnected;
        if self.clean_session {
            self.tracker.reset();
        }
        debug!(
            client_id = %self.client_id,
            reason = ?self.terminated,
            uptime = ?self.created_at.elapsed(),
            "session terminated"
        );
        true
    }

    /// Periodic keep-alive check, driven by the caller's timer.
    ///
    /// With negotiated interval K: a client emits PINGREQ after K of its
    /// own send silence; either role expires after 1.5x K without any
    /// packet from the peer. K = 0 disables both.
    pub(crate) fn tick(&mut self, now: Instant) -> PacketOutcome {
        if self.state != ConnectionState::Connected || self.keep_alive.is_zero() {
            return PacketOutcome::none();
        }

        let timeout = self.keep_alive + self.keep_alive / 2;
        let peer_silence = now
            .checked_duration_since(self.last_inbound)
            .unwrap_or(Duration::ZERO);
        if peer_silence >= timeout {
            warn!(
                client_id = %self.client_id,
                silence = ?peer_silence,
                keep_alive = ?self.keep_alive,
                "keep-alive expired"
            );
            self.begin_termination(TerminateReason::KeepAliveExpired);
            return PacketOutcome::none().terminated(TerminateReason::KeepAliveExpired);
        }

        if self.role == SessionRole::Client {
            let send_silence = now
                .checked_duration_since(self.last_outbound)
                .unwrap_or(Duration::ZERO);
            if send_silence >= self.keep_alive {
                self.last_outbound = now;
                return PacketOutcome::respond(MqttPacket::PingReq);
            }
        }

        PacketOutcome::none()
    }

    /// Sender side of a publish: QoS 0 goes out without an identifier;
    /// QoS 1/2 allocate and register one, which can fail with
    /// [`SessionError::IdentifierSpaceExhausted`].
    pub(crate) fn start_publish(
        &mut self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> SessionResult<MqttPacket> {
        if self.state != ConnectionState::Connected {
            return Err(SessionError::SessionNotEstablished);
        }

        let publish = Publish::new(topic, payload).with_retain(retain);
        let packet = match qos {
            QoS::AtMostOnce => publish,
            QoS::AtLeastOnce => {
                let id = self.tracker.allocate()?;
                let publish = publish.with_qos(qos, id);
                self.tracker.register_outbound(
                    id,
                    OutboundStage::AwaitingPuback,
                    OutboundRequest::Publish(publish.clone()),
                )?;
                publish
            }
            QoS::ExactlyOnce => {
                let id = self.tracker.allocate()?;
                let publish = publish.with_qos(qos, id);
                self.tracker.register_outbound(
                    id,
                    OutboundStage::AwaitingPubrec,
                    OutboundRequest::Publish(publish.clone()),
                )?;
                publish
            }
        };

        self.note_outbound();
        Ok(MqttPacket::Publish(packet))
    }

    /// Receiver side of a publish, identical for both roles.
    ///
    /// QoS 0 and QoS 1 deliver immediately; QoS 1 always answers PUBACK,
    /// including for duplicates. QoS 2 registers the identifier and holds
    /// the message back until PUBREL; a repeated PUBLISH with the same
    /// identifier only repeats the PUBREC.
    pub(crate) fn receive_publish(&mut self, publish: Publish) -> SessionResult<ReceivedPublish> {
        match publish.qos {
            QoS::AtMostOnce => Ok(ReceivedPublish::Deliver {
                message: ApplicationMessage::from_publish(&publish),
                ack: None,
            }),
            QoS::AtLeastOnce => {
                let id = require_packet_id(&publish)?;
                Ok(ReceivedPublish::Deliver {
                    message: ApplicationMessage::from_publish(&publish),
                    ack: Some(MqttPacket::PubAck(PubAck::new(id))),
                })
            }
            QoS::ExactlyOnce => {
                let id = require_packet_id(&publish)?;
                if !self.tracker.is_duplicate_inbound(id) {
                    self.tracker.register_inbound(id, publish);
                } else {
                    debug!(
                        client_id = %self.client_id,
                        packet_id = id,
                        "duplicate QoS 2 PUBLISH before PUBREL, repeating PUBREC"
                    );
                }
                Ok(ReceivedPublish::Recorded {
                    ack: MqttPacket::PubRec(PubRec::new(id)),
                })
            }
        }
    }

    /// PUBREL handling: release the inbound registration and return the
    /// stored message for delivery. A PUBREL for an identifier we no
    /// longer hold still gets its PUBCOMP; exactly-once is measured at the
    /// application-delivery boundary, not the acknowledgment boundary.
    pub(crate) fn receive_pubrel(
        &mut self,
        packet_id: u16,
    ) -> SessionResult<(Option<Publish>, MqttPacket)> {
        let released = self.tracker.release_inbound(packet_id);
        Ok((released, MqttPacket::PubComp(PubComp::new(packet_id))))
    }

    /// Sender-side acknowledgment handling shared by both roles: PUBACK,
    /// PUBREC and PUBCOMP advance the tracker entry and either finish the
    /// handshake or emit the next packet.
    pub(crate) fn apply_publish_ack(
        &mut self,
        packet_id: u16,
        ack: PacketType,
    ) -> SessionResult<PacketOutcome> {
        match self.tracker.advance_outbound(packet_id, ack)? {
            NextAction::PublishAcked { packet_id } => {
                Ok(PacketOutcome::event(SessionEvent::PublishCompleted {
                    packet_id,
                    qos: QoS::AtLeastOnce,
                }))
            }
            NextAction::SendPubrel(pubrel) => {
                Ok(PacketOutcome::respond(MqttPacket::PubRel(pubrel)))
            }
            NextAction::PublishComplete { packet_id } => {
                Ok(PacketOutcome::event(SessionEvent::PublishCompleted {
                    packet_id,
                    qos: QoS::ExactlyOnce,
                }))
            }
            NextAction::SubscribeAcked { packet_id, .. }
            | NextAction::UnsubscribeAcked { packet_id, .. } => {
                Err(SessionError::ProtocolViolation(format!(
                    "{ack} for identifier {packet_id} bound to a subscription request"
                )))
            }
        }
    }
}

fn require_packet_id(publish: &Publish) -> SessionResult<u16> {
    match publish.packet_id {
        Some(0) => Err(SessionError::MalformedPacket(
            "PUBLISH with reserved packet identifier 0".to_string(),
        )),
        Some(id) => Ok(id),
        None => Err(SessionError::MalformedPacket(format!(
            "QoS {} PUBLISH without packet identifier",
            publish.qos as u8
        ))),
    }
}

/// Per-packet-type handler operations plus the single dispatch routing a
/// decoded packet to them.
///
/// The default handler bodies reject packet types the role cannot legally
/// receive, so a role only implements the operations it accepts. PINGREQ
/// and PINGRESP have working defaults: any endpoint answers a ping, and a
/// ping response only refreshes liveness.
pub trait PacketFlow {
    /// Shared engine access.
    fn core(&self) -> &SessionCore;

    /// Shared engine access, mutable.
    fn core_mut(&mut self) -> &mut SessionCore;

    /// Handle CONNECT (broker only).
    fn handle_connect(&mut self, connect: Connect) -> SessionResult<PacketOutcome> {
        let _ = connect;
        Err(reject(self.core(), PacketType::Connect))
    }

    /// Handle CONNACK (client only).
    fn handle_connack(&mut self, connack: ConnAck) -> SessionResult<PacketOutcome> {
        let _ = connack;
        Err(reject(self.core(), PacketType::ConnAck))
    }

    /// Handle an inbound PUBLISH.
    fn handle_publish(&mut self, publish: Publish) -> SessionResult<PacketOutcome> {
        let _ = publish;
        Err(reject(self.core(), PacketType::Publish))
    }

    /// Handle PUBACK for one of our QoS 1 publishes.
    fn handle_puback(&mut self, puback: PubAck) -> SessionResult<PacketOutcome> {
        let _ = puback;
        Err(reject(self.core(), PacketType::PubAck))
    }

    /// Handle PUBREC for one of our QoS 2 publishes.
    fn handle_pubrec(&mut self, pubrec: PubRec) -> SessionResult<PacketOutcome> {
        let _ = pubrec;
        Err(reject(self.core(), PacketType::PubRec))
    }

    /// Handle PUBREL for a QoS 2 publish the peer sent us.
    fn handle_pubrel(&mut self, pubrel: PubRel) -> SessionResult<PacketOutcome> {
        let _ = pubrel;
        Err(reject(self.core(), PacketType::PubRel))
    }

    /// Handle PUBCOMP finishing one of our QoS 2 publishes.
    fn handle_pubcomp(&mut self, pubcomp: PubComp) -> SessionResult<PacketOutcome> {
        let _ = pubcomp;
        Err(reject(self.core(), PacketType::PubComp))
    }

    /// Handle SUBSCRIBE (broker only).
    fn handle_subscribe(&mut self, subscribe: Subscribe) -> SessionResult<PacketOutcome> {
        let _ = subscribe;
        Err(reject(self.core(), PacketType::Subscribe))
    }

    /// Handle SUBACK (client only).
    fn handle_suback(&mut self, suback: SubAck) -> SessionResult<PacketOutcome> {
        let _ = suback;
        Err(reject(self.core(), PacketType::SubAck))
    }

    /// Handle UNSUBSCRIBE (broker only).
    fn handle_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> SessionResult<PacketOutcome> {
        let _ = unsubscribe;
        Err(reject(self.core(), PacketType::Unsubscribe))
    }

    /// Handle UNSUBACK (client only).
    fn handle_unsuback(&mut self, unsuback: UnsubAck) -> SessionResult<PacketOutcome> {
        let _ = unsuback;
        Err(reject(self.core(), PacketType::UnsubAck))
    }

    /// Handle PINGREQ: answer with PINGRESP.
    fn handle_pingreq(&mut self) -> SessionResult<PacketOutcome> {
        Ok(PacketOutcome::respond(MqttPacket::PingResp))
    }

    /// Handle PINGRESP: liveness was already refreshed by dispatch.
    fn handle_pingresp(&mut self) -> SessionResult<PacketOutcome> {
        Ok(PacketOutcome::none())
    }

    /// Handle DISCONNECT (broker only in MQTT 3.1.1).
    fn handle_disconnect(&mut self) -> SessionResult<PacketOutcome> {
        Err(reject(self.core(), PacketType::Disconnect))
    }

    /// Hand one decoded packet to the session.
    ///
    /// Validates the packet against the connection state, refreshes
    /// liveness, dispatches to the per-type handler, and latches the
    /// session into `Disconnecting` on any fatal error so later packets
    /// are refused.
    fn deliver_packet(&mut self, packet: MqttPacket) -> SessionResult<PacketOutcome> {
        let ptype = packet.packet_type();

        match self.core().state() {
            ConnectionState::Disconnected => {
                let broker_connect = self.core().role() == SessionRole::Broker
                    && ptype == PacketType::Connect;
                if !broker_connect {
                    return Err(SessionError::SessionNotEstablished);
                }
            }
            ConnectionState::Disconnecting => return Err(SessionError::SessionNotEstablished),
            ConnectionState::Connecting => {
                if ptype != PacketType::ConnAck {
                    return Err(self.fail(SessionError::ProtocolViolation(format!(
                        "{ptype} before the connection handshake completed"
                    ))));
                }
            }
            ConnectionState::Connected => {
                if matches!(ptype, PacketType::Connect | PacketType::ConnAck) {
                    return Err(self.fail(SessionError::ProtocolViolation(format!(
                        "{ptype} on an established connection"
                    ))));
                }
            }
        }

        if packet.packet_id() == Some(0) {
            return Err(self.fail(SessionError::MalformedPacket(format!(
                "{ptype} with reserved packet identifier 0"
            ))));
        }

        self.core_mut().note_inbound();

        let result = match packet {
            MqttPacket::Connect(p) => self.handle_connect(p),
            MqttPacket::ConnAck(p) => self.handle_connack(p),
            MqttPacket::Publish(p) => self.handle_publish(p),
            MqttPacket::PubAck(p) => self.handle_puback(p),
            MqttPacket::PubRec(p) => self.handle_pubrec(p),
            MqttPacket::PubRel(p) => self.handle_pubrel(p),
            MqttPacket::PubComp(p) => self.handle_pubcomp(p),
            MqttPacket::Subscribe(p) => self.handle_subscribe(p),
            MqttPacket::SubAck(p) => self.handle_suback(p),
            MqttPacket::Unsubscribe(p) => self.handle_unsubscribe(p),
            MqttPacket::UnsubAck(p) => self.handle_unsuback(p),
            MqttPacket::PingReq => self.handle_pingreq(),
            MqttPacket::PingResp => self.handle_pingresp(),
            MqttPacket::Disconnect => self.handle_disconnect(),
        };

        match result {
            Ok(outcome) => {
                if !outcome.packets.is_empty() {
                    self.core_mut().note_outbound();
                }
                Ok(outcome)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Periodic keep-alive check; see [`SessionCore`] for the timing
    /// rules.
    fn on_tick(&mut self, now: Instant) -> PacketOutcome {
        self.core_mut().tick(now)
    }

    /// Latch fatal errors: the session stops accepting packets and records
    /// the violation as its terminate reason. Non-fatal errors pass
    /// through.
    #[doc(hidden)]
    fn fail(&mut self, err: SessionError) -> SessionError {
        if err.is_fatal() {
            warn!(
                client_id = %self.core().client_id(),
                error = %err,
                "fatal protocol error, refusing further packets"
            );
            self.core_mut()
                .begin_termination(TerminateReason::ProtocolViolation(err.to_string()));
        }
        err
    }
}

fn reject(core: &SessionCore, ptype: PacketType) -> SessionError {
    SessionError::ProtocolViolation(format!(
        "{ptype} not valid for a {:?} session",
        core.role()
    ))
}
