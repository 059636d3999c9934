//! Client-side session.
//!
//! A [`ClientSession`] initiates the connection: it builds the CONNECT and
//! the outgoing requests (PUBLISH, SUBSCRIBE, UNSUBSCRIBE, DISCONNECT) for
//! the caller to write, and consumes the packets the broker sends back
//! through [`PacketFlow::deliver_packet`]. Granted subscriptions are
//! recorded when the SUBACK confirms them, not when the request goes out.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::config::ProtocolVersion;
use crate::error::{SessionError, SessionResult};
use crate::packet::{
    ConnAck, Connect, MqttPacket, PacketType, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    SubAck, Subscribe, Subscription, UnsubAck, Unsubscribe, Will,
};
use crate::session::{
    ApplicationMessage, ConnectionState, PacketFlow, PacketOutcome, ReceivedPublish, SessionCore,
    SessionEvent, SessionRole, SubscribeGrant, TerminateReason,
};
use crate::tracker::{NextAction, OutboundRequest, OutboundStage};

/// Options shaping the CONNECT packet a client session sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Protocol version to announce.
    pub protocol: ProtocolVersion,
    /// Ask the broker to discard state from earlier connections.
    pub clean_session: bool,
    /// Keep-alive interval; zero disables keep-alive monitoring.
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Optional username credential.
    pub username: Option<String>,
    /// Optional password credential.
    pub password: Option<String>,
    /// Optional will message the broker publishes if this session ends
    /// abnormally.
    pub will: Option<Will>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            protocol: ProtocolVersion::V311,
            clean_session: true,
            keep_alive: Duration::from_secs(60),
            username: None,
            password: None,
            will: None,
        }
    }
}

/// Connection-initiator session state machine.
#[derive(Debug)]
pub struct ClientSession {
    core: SessionCore,
    options: ConnectOptions,
    /// Filters confirmed by SUBACK, with their granted QoS.
    subscriptions: HashMap<String, QoS>,
}

impl ClientSession {
    /// Create a session for `client_id` with the given connect options.
    pub fn new(client_id: impl Into<String>, options: ConnectOptions) -> Self {
        let core = SessionCore::new(
            client_id,
            SessionRole::Client,
            options.clean_session,
            options.keep_alive,
        );
        Self {
            core,
            options,
            subscriptions: HashMap::new(),
        }
    }

    /// Build the CONNECT packet and move to `Connecting`. Valid once, on a
    /// fresh session.
    pub fn connect(&mut self) -> SessionResult<MqttPacket> {
        if self.core.state() != ConnectionState::Disconnected
            || self.core.terminate_reason().is_some()
        {
            return Err(SessionError::SessionNotEstablished);
        }

        let keep_alive =
            u16::try_from(self.options.keep_alive.as_secs()).unwrap_or(u16::MAX);
        let connect = Connect {
            protocol_name: self.options.protocol.name().to_string(),
            protocol_level: self.options.protocol.level(),
            clean_session: self.options.clean_session,
            will: self.options.will.clone(),
            username: self.options.username.clone(),
            password: self.options.password.clone().map(Into::into),
            keep_alive,
            client_id: self.core.client_id().to_string(),
        };

        debug!(
            client_id = %self.core.client_id(),
            protocol = self.options.protocol.name(),
            clean_session = self.options.clean_session,
            keep_alive,
            "initiating connection"
        );
        self.core.set_state(ConnectionState::Connecting);
        self.core.note_outbound();
        Ok(MqttPacket::Connect(connect))
    }

    /// Build a PUBLISH at the given QoS. QoS 1/2 register a packet
    /// identifier and can fail with
    /// [`SessionError::IdentifierSpaceExhausted`] while 65535 publishes
    /// are unacknowledged.
    pub fn publish(
        &mut self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> SessionResult<MqttPacket> {
        self.core.start_publish(topic, payload, qos, retain)
    }

    /// Build a SUBSCRIBE for the given filters; grants arrive via SUBACK.
    pub fn subscribe(&mut self, subscriptions: Vec<Subscription>) -> SessionResult<MqttPacket> {
        if !self.core.is_connected() {
            return Err(SessionError::SessionNotEstablished);
        }
        if subscriptions.is_empty() {
            return Err(SessionError::MalformedPacket(
                "SUBSCRIBE with no topic filters".to_string(),
            ));
        }

        let packet_id = self.core.tracker_mut().allocate()?;
        self.core.tracker_mut().register_outbound(
            packet_id,
            OutboundStage::AwaitingSuback,
            OutboundRequest::Subscribe(subscriptions.clone()),
        )?;
        self.core.note_outbound();
        Ok(MqttPacket::Subscribe(Subscribe::new(packet_id, subscriptions)))
    }

    /// Build an UNSUBSCRIBE; local grant records are dropped when the
    /// UNSUBACK confirms.
    pub fn unsubscribe(&mut self, topics: Vec<String>) -> SessionResult<MqttPacket> {
        if !self.core.is_connected() {
            return Err(SessionError::SessionNotEstablished);
        }
        if topics.is_empty() {
            return Err(SessionError::MalformedPacket(
                "UNSUBSCRIBE with no topic filters".to_string(),
            ));
        }

        let packet_id = self.core.tracker_mut().allocate()?;
        self.core.tracker_mut().register_outbound(
            packet_id,
            OutboundStage::AwaitingUnsuback,
            OutboundRequest::Unsubscribe(topics.clone()),
        )?;
        self.core.note_outbound();
        Ok(MqttPacket::Unsubscribe(Unsubscribe::new(packet_id, topics)))
    }

    /// Build the DISCONNECT for a clean termination. The session stops
    /// accepting packets; no acknowledgment follows.
    pub fn disconnect(&mut self) -> SessionResult<MqttPacket> {
        if !self.core.is_connected() {
            return Err(SessionError::SessionNotEstablished);
        }
        self.core.begin_termination(TerminateReason::NormalDisconnect);
        self.core.note_outbound();
        Ok(MqttPacket::Disconnect)
    }

    /// Filters the broker has granted, with their granted QoS.
    pub fn subscriptions(&self) -> &HashMap<String, QoS> {
        &self.subscriptions
    }
}

impl PacketFlow for ClientSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    fn handle_connack(&mut self, connack: ConnAck) -> SessionResult<PacketOutcome> {
        if !connack.return_code.is_accepted() {
            debug!(
                client_id = %self.core.client_id(),
                code = ?connack.return_code,
                "connection refused"
            );
            self.core
                .begin_termination(TerminateReason::ConnectRefused(connack.return_code));
            return Ok(PacketOutcome::event(SessionEvent::ConnectRefused(
                connack.return_code,
            ))
            .terminated(TerminateReason::ConnectRefused(connack.return_code)));
        }

        if self.options.clean_session && connack.session_present {
            return Err(SessionError::ProtocolViolation(
                "CONNACK with session present on a clean session".to_string(),
            ));
        }

        self.core.set_state(ConnectionState::Connected);
        Ok(PacketOutcome::event(SessionEvent::Connected {
            session_present: connack.session_present,
        }))
    }

    fn handle_publish(&mut self, publish: Publish) -> SessionResult<PacketOutcome> {
        match self.core.receive_publish(publish)? {
            ReceivedPublish::Deliver { message, ack } => {
                let mut outcome = PacketOutcome::event(SessionEvent::MessageReceived(message));
                outcome.packets.extend(ack);
                Ok(outcome)
            }
            ReceivedPublish::Recorded { ack } => Ok(PacketOutcome::respond(ack)),
        }
    }

    fn handle_puback(&mut self, puback: PubAck) -> SessionResult<PacketOutcome> {
        self.core.apply_publish_ack(puback.packet_id, PacketType::PubAck)
    }

    fn handle_pubrec(&mut self, pubrec: PubRec) -> SessionResult<PacketOutcome> {
        self.core.apply_publish_ack(pubrec.packet_id, PacketType::PubRec)
    }

    fn handle_pubrel(&mut self, pubrel: PubRel) -> SessionResult<PacketOutcome> {
        let (released, ack) = self.core.receive_pubrel(pubrel.packet_id)?;
        let mut outcome = PacketOutcome::respond(ack);
        if let Some(publish) = released {
            outcome
                .events
                .push(SessionEvent::MessageReceived(ApplicationMessage::from_publish(&publish)));
        }
        Ok(outcome)
    }

    fn handle_pubcomp(&mut self, pubcomp: PubComp) -> SessionResult<PacketOutcome> {
        self.core.apply_publish_ack(pubcomp.packet_id, PacketType::PubComp)
    }

    fn handle_suback(&mut self, suback: SubAck) -> SessionResult<PacketOutcome> {
        match self
            .core
            .tracker_mut()
            .advance_outbound(suback.packet_id, PacketType::SubAck)?
        {
            NextAction::SubscribeAcked {
                packet_id,
                requested,
            } => {
                if suback.return_codes.len() != requested.len() {
                    return Err(SessionError::MalformedPacket(format!(
                        "SUBACK with {} return codes for {} requested filters",
                        suback.return_codes.len(),
                        requested.len()
                    )));
                }

                let grants: Vec<SubscribeGrant> = requested
                    .into_iter()
                    .zip(suback.return_codes)
                    .map(|(subscription, code)| {
                        if let Some(granted) = code.granted_qos() {
                            self.subscriptions
                                .insert(subscription.topic_filter.clone(), granted);
                        }
                        SubscribeGrant::new(subscription.topic_filter, code)
                    })
                    .collect();

                Ok(PacketOutcome::event(SessionEvent::SubscribeCompleted {
                    packet_id,
                    grants,
                }))
            }
            _ => Err(SessionError::ProtocolViolation(format!(
                "SUBACK {} did not match a subscribe request",
                suback.packet_id
            ))),
        }
    }

    fn handle_unsuback(&mut self, unsuback: UnsubAck) -> SessionResult<PacketOutcome> {
        match self
            .core
            .tracker_mut()
            .advance_outbound(unsuback.packet_id, PacketType::UnsubAck)?
        {
            NextAction::UnsubscribeAcked { packet_id, topics } => {
                for topic in &topics {
                    self.subscriptions.remove(topic);
                }
                Ok(PacketOutcome::event(SessionEvent::UnsubscribeCompleted {
                    packet_id,
                    topics,
                }))
            }
            _ => Err(SessionError::ProtocolViolation(format!(
                "UNSUBACK {} did not match an unsubscribe request",
                unsuback.packet_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ConnectReturnCode, SubscribeReturnCode};

    fn connected_client() -> ClientSession {
        let mut client = ClientSession::new("unit-client", ConnectOptions::default());
        client.connect().unwrap();
        client
            .deliver_packet(MqttPacket::ConnAck(ConnAck::accepted(false)))
            .unwrap();
        client
    }

    #[test]
    fn test_connect_builds_packet_and_transitions() {
        let options = ConnectOptions {
            keep_alive: Duration::from_secs(30),
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            ..ConnectOptions::default()
        };
        let mut client = ClientSession::new("c1", options);

        let packet = client.connect().unwrap();
        match packet {
            MqttPacket::Connect(connect) => {
                assert_eq!(connect.protocol_name, "MQTT");
                assert_eq!(connect.protocol_level, 4);
                assert_eq!(connect.client_id, "c1");
                assert_eq!(connect.keep_alive, 30);
                assert!(connect.clean_session);
                assert_eq!(connect.username.as_deref(), Some("user"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.core().state(), ConnectionState::Connecting);

        // A second CONNECT attempt on the same session is refused.
        assert_eq!(
            client.connect().unwrap_err(),
            SessionError::SessionNotEstablished
        );
    }

    #[test]
    fn test_connack_accepted_completes_handshake() {
        let mut client = ClientSession::new("c1", ConnectOptions::default());
        client.connect().unwrap();

        let outcome = client
            .deliver_packet(MqttPacket::ConnAck(ConnAck::accepted(false)))
            .unwrap();
        assert!(client.core().is_connected());
        assert!(matches!(
            outcome.events.as_slice(),
            [SessionEvent::Connected {
                session_present: false
            }]
        ));
    }

    #[test]
    fn test_connack_refused_terminates() {
        let mut client = ClientSession::new("c1", ConnectOptions::default());
        client.connect().unwrap();

        let outcome = client
            .deliver_packet(MqttPacket::ConnAck(ConnAck::refused(
                ConnectReturnCode::NotAuthorized,
            )))
            .unwrap();
        assert_eq!(
            outcome.terminate,
            Some(TerminateReason::ConnectRefused(
                ConnectReturnCode::NotAuthorized
            ))
        );
        assert!(outcome.packets.is_empty());

        // The session refuses anything further.
        let err = client.deliver_packet(MqttPacket::PingResp).unwrap_err();
        assert_eq!(err, SessionError::SessionNotEstablished);
    }

    #[test]
    fn test_session_present_on_clean_session_is_violation() {
        let mut client = ClientSession::new("c1", ConnectOptions::default());
        client.connect().unwrap();

        let err = client
            .deliver_packet(MqttPacket::ConnAck(ConnAck::accepted(true)))
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
        assert_eq!(client.core().state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn test_publish_before_connect_is_refused() {
        let mut client = ClientSession::new("c1", ConnectOptions::default());
        let err = client
            .publish("t", "p", QoS::AtMostOnce, false)
            .unwrap_err();
        assert_eq!(err, SessionError::SessionNotEstablished);
    }

    #[test]
    fn test_qos1_publish_flow() {
        let mut client = connected_client();

        let packet = client.publish("a/b", "hi", QoS::AtLeastOnce, false).unwrap();
        let packet_id = packet.packet_id().unwrap();
        assert_eq!(client.core().outbound_in_flight(), 1);

        let outcome = client
            .deliver_packet(MqttPacket::PubAck(PubAck::new(packet_id)))
            .unwrap();
        assert!(matches!(
            outcome.events.as_slice(),
            [SessionEvent::PublishCompleted {
                qos: QoS::AtLeastOnce,
                ..
            }]
        ));
        assert_eq!(client.core().outbound_in_flight(), 0);
    }

    #[test]
    fn test_qos2_publish_full_round_trip() {
        let mut client = connected_client();

        let packet = client
            .publish("a/b", "payload", QoS::ExactlyOnce, false)
            .unwrap();
        let packet_id = packet.packet_id().unwrap();

        let outcome = client
            .deliver_packet(MqttPacket::PubRec(PubRec::new(packet_id)))
            .unwrap();
        assert!(matches!(
            outcome.packets.as_slice(),
            [MqttPacket::PubRel(p)] if p.packet_id == packet_id
        ));
        assert_eq!(client.core().outbound_in_flight(), 1);

        let outcome = client
            .deliver_packet(MqttPacket::PubComp(PubComp::new(packet_id)))
            .unwrap();
        assert!(matches!(
            outcome.events.as_slice(),
            [SessionEvent::PublishCompleted {
                qos: QoS::ExactlyOnce,
                ..
            }]
        ));
        assert_eq!(client.core().outbound_in_flight(), 0);
    }

    #[test]
    fn test_pubcomp_before_pubrec_is_violation() {
        let mut client = connected_client();

        let packet = client
            .publish("a/b", "p", QoS::ExactlyOnce, false)
            .unwrap();
        let packet_id = packet.packet_id().unwrap();

        let err = client
            .deliver_packet(MqttPacket::PubComp(PubComp::new(packet_id)))
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
        assert_eq!(client.core().state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn test_subscribe_grants_recorded_from_suback() {
        let mut client = connected_client();

        let packet = client
            .subscribe(vec![
                Subscription::new("a/b", QoS::AtLeastOnce),
                Subscription::new("c/d", QoS::ExactlyOnce),
            ])
            .unwrap();
        let packet_id = packet.packet_id().unwrap();

        let suback = SubAck::new(
            packet_id,
            vec![SubscribeReturnCode::SuccessQoS1, SubscribeReturnCode::Failure],
        );
        let outcome = client.deliver_packet(MqttPacket::SubAck(suback)).unwrap();

        match outcome.events.as_slice() {
            [SessionEvent::SubscribeCompleted { grants, .. }] => {
                assert_eq!(grants.len(), 2);
                assert_eq!(grants[0].granted, Some(QoS::AtLeastOnce));
                assert_eq!(grants[1].granted, None);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert_eq!(client.subscriptions().get("a/b"), Some(&QoS::AtLeastOnce));
        assert!(!client.subscriptions().contains_key("c/d"));
    }

    #[test]
    fn test_suback_code_count_mismatch_is_malformed() {
        let mut client = connected_client();

        let packet = client
            .subscribe(vec![
                Subscription::new("a/b", QoS::AtMostOnce),
                Subscription::new("c/d", QoS::AtMostOnce),
            ])
            .unwrap();
        let packet_id = packet.packet_id().unwrap();

        let suback = SubAck::new(packet_id, vec![SubscribeReturnCode::SuccessQoS0]);
        let err = client
            .deliver_packet(MqttPacket::SubAck(suback))
            .unwrap_err();
        assert!(matches!(err, SessionError::MalformedPacket(_)));
        assert_eq!(client.core().state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn test_unknown_suback_is_violation_and_latches() {
        let mut client = connected_client();

        let suback = SubAck::new(99, vec![SubscribeReturnCode::SuccessQoS0]);
        let err = client
            .deliver_packet(MqttPacket::SubAck(suback))
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));

        let err = client.deliver_packet(MqttPacket::PingResp).unwrap_err();
        assert_eq!(err, SessionError::SessionNotEstablished);
    }

    #[test]
    fn test_unsubscribe_drops_grant_on_unsuback() {
        let mut client = connected_client();

        let packet = client
            .subscribe(vec![Subscription::new("a/b", QoS::AtLeastOnce)])
            .unwrap();
        let sub_id = packet.packet_id().unwrap();
        client
            .deliver_packet(MqttPacket::SubAck(SubAck::new(
                sub_id,
                vec![SubscribeReturnCode::SuccessQoS1],
            )))
            .unwrap();
        assert!(client.subscriptions().contains_key("a/b"));

        let packet = client.unsubscribe(vec!["a/b".to_string()]).unwrap();
        let unsub_id = packet.packet_id().unwrap();
        let outcome = client
            .deliver_packet(MqttPacket::UnsubAck(UnsubAck::new(unsub_id)))
            .unwrap();
        assert!(matches!(
            outcome.events.as_slice(),
            [SessionEvent::UnsubscribeCompleted { .. }]
        ));
        assert!(client.subscriptions().is_empty());
    }

    #[test]
    fn test_inbound_qos2_delivers_once_at_pubrel() {
        let mut client = connected_client();

        let publish = Publish::new("a/b", "m").with_qos(QoS::ExactlyOnce, 7);
        let outcome = client
            .deliver_packet(MqttPacket::Publish(publish.clone()))
            .unwrap();
        assert!(
            matches!(outcome.packets.as_slice(), [MqttPacket::PubRec(p)] if p.packet_id == 7)
        );
        assert!(outcome.events.is_empty());

        // Retransmitted PUBLISH before PUBREL: only the PUBREC repeats.
        let outcome = client.deliver_packet(MqttPacket::Publish(publish)).unwrap();
        assert!(matches!(outcome.packets.as_slice(), [MqttPacket::PubRec(_)]));
        assert!(outcome.events.is_empty());

        let outcome = client
            .deliver_packet(MqttPacket::PubRel(PubRel::new(7)))
            .unwrap();
        assert!(
            matches!(outcome.packets.as_slice(), [MqttPacket::PubComp(p)] if p.packet_id == 7)
        );
        assert!(matches!(
            outcome.events.as_slice(),
            [SessionEvent::MessageReceived(m)] if m.topic == "a/b"
        ));
    }

    #[test]
    fn test_disconnect_stops_the_session() {
        let mut client = connected_client();

        let packet = client.disconnect().unwrap();
        assert!(matches!(packet, MqttPacket::Disconnect));

        let err = client.deliver_packet(MqttPacket::PingResp).unwrap_err();
        assert_eq!(err, SessionError::SessionNotEstablished);

        assert!(client.core_mut().terminate(TerminateReason::TransportClosed));
        assert_eq!(
            client.core().terminate_reason(),
            Some(&TerminateReason::NormalDisconnect)
        );
    }

    #[test]
    fn test_connect_options_from_toml() {
        let options: ConnectOptions = toml::from_str(
            r#"
            protocol = "3.1"
            clean_session = false
            keep_alive = "30s"
            username = "svc"
            "#,
        )
        .unwrap();

        assert_eq!(options.protocol, ProtocolVersion::V31);
        assert!(!options.clean_session);
        assert_eq!(options.keep_alive, Duration::from_secs(30));
        assert_eq!(options.username.as_deref(), Some("svc"));
        assert!(options.password.is_none());
    }
}
