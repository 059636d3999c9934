//! Broker-side session.
//!
//! A [`BrokerSession`] accepts one client connection: it validates CONNECT
//! before picking the CONNACK return code, authorizes subscriptions
//! through the external [`SubscriptionAuthority`], and routes inbound
//! publishes through the external [`PublishRouter`]. Fan-out legs come
//! back as [`ForwardPublish`] values; each target session then runs its
//! own sender-side handshake with an identifier from its own tracker, so
//! one inbound publish can spawn many independent outbound delivery state
//! machines.
//!
//! The session holds the client's will message and releases it only for
//! an abnormal end; a clean DISCONNECT discards it.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::packet::{
    ConnAck, Connect, ConnectReturnCode, MqttPacket, PacketType, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, Subscription, UnsubAck, Unsubscribe,
    Will,
};
use crate::session::{
    ApplicationMessage, ConnectionState, ForwardPublish, PacketFlow, PacketOutcome,
    ReceivedPublish, SessionCore, SessionEvent, SessionRole, TerminateReason,
};
use crate::tracker::PacketIdTracker;

/// Fan-out collaborator: matches a published topic against the
/// subscription table shared by all sessions.
///
/// Implementations must be safe for concurrent access; many sessions
/// route through one router.
pub trait PublishRouter: Send + Sync {
    /// Return the fan-out targets for `topic` as (subscriber client id,
    /// granted QoS) pairs. When `retain` is set the collaborator also
    /// stores the message as the topic's retained message.
    fn route_publish(
        &self,
        topic: &str,
        payload: &Bytes,
        qos: QoS,
        retain: bool,
    ) -> Vec<(String, QoS)>;
}

/// Subscription-registry collaborator: filter authorization and
/// bookkeeping, plus the optional credential check during CONNECT.
pub trait SubscriptionAuthority: Send + Sync {
    /// Authorize and register a filter for `client_id`. The returned code
    /// carries the granted QoS, which may be lower than requested, or the
    /// failure marker.
    fn authorize_subscribe(
        &self,
        client_id: &str,
        subscription: &Subscription,
    ) -> SubscribeReturnCode;

    /// Drop a registered filter for `client_id`.
    fn remove_subscription(&self, client_id: &str, topic_filter: &str);

    /// Credential check during CONNECT validation. Accepts everyone
    /// unless overridden.
    fn authorize_connect(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&Bytes>,
    ) -> ConnectReturnCode {
        let _ = (client_id, username, password);
        ConnectReturnCode::Accepted
    }
}

/// Connection-acceptor session state machine.
pub struct BrokerSession {
    core: SessionCore,
    config: SessionConfig,
    router: Arc<dyn PublishRouter>,
    authority: Arc<dyn SubscriptionAuthority>,
    /// Granted filters for this client, mirroring the authority's
    /// registrations. A repeated filter replaces its granted QoS.
    subscriptions: HashMap<String, QoS>,
    will: Option<Will>,
    session_present: bool,
}

impl BrokerSession {
    /// Create a session awaiting its CONNECT.
    pub fn new(
        config: SessionConfig,
        router: Arc<dyn PublishRouter>,
        authority: Arc<dyn SubscriptionAuthority>,
    ) -> Self {
        let keep_alive = config.default_keep_alive;
        Self {
            core: SessionCore::new("", SessionRole::Broker, true, keep_alive),
            config,
            router,
            authority,
            subscriptions: HashMap::new(),
            will: None,
            session_present: false,
        }
    }

    /// Granted filters for this client.
    pub fn subscriptions(&self) -> &HashMap<String, QoS> {
        &self.subscriptions
    }

    /// Take the will message for publication. Present only after an
    /// abnormal end; a clean DISCONNECT discards it.
    pub fn take_will(&mut self) -> Option<Will> {
        self.will.take()
    }

    /// Run this session's own sender-side handshake for one fan-out leg.
    /// The forwarded PUBLISH goes out with dup and retain cleared and, for
    /// QoS 1/2, a fresh identifier from this subscriber's tracker.
    pub fn forward_publish(
        &mut self,
        message: &ApplicationMessage,
        qos: QoS,
    ) -> SessionResult<MqttPacket> {
        self.core
            .start_publish(message.topic.clone(), message.payload.clone(), qos, false)
    }

    /// Install state parked from this client's previous persistent
    /// session. Called before the CONNECT is delivered; the handshake
    /// then reports `session_present`.
    pub(crate) fn install_resumed(
        &mut self,
        subscriptions: HashMap<String, QoS>,
        tracker: PacketIdTracker,
    ) {
        self.subscriptions = subscriptions;
        self.core.install_tracker(tracker);
        self.session_present = true;
    }

    /// Extract the state that survives a persistent disconnect.
    pub(crate) fn park(&mut self) -> (HashMap<String, QoS>, PacketIdTracker) {
        (
            std::mem::take(&mut self.subscriptions),
            self.core.take_tracker(),
        )
    }

    fn refuse_connect(&mut self, code: ConnectReturnCode) -> PacketOutcome {
        warn!(code = ?code, "connection refused");
        self.core
            .begin_termination(TerminateReason::ConnectRefused(code));
        let mut outcome = PacketOutcome::respond(MqttPacket::ConnAck(ConnAck::refused(code)));
        outcome.events.push(SessionEvent::ConnectRefused(code));
        outcome.terminated(TerminateReason::ConnectRefused(code))
    }

    /// Route a delivered message and build the fan-out legs. Each leg is
    /// capped at the QoS granted to that subscriber.
    fn fan_out(&self, message: ApplicationMessage) -> Vec<ForwardPublish> {
        let targets = self.router.route_publish(
            &message.topic,
            &message.payload,
            message.qos,
            message.retain,
        );
        debug!(
            client_id = %self.core.client_id(),
            topic = %message.topic,
            subscribers = targets.len(),
            "routing publish"
        );
        targets
            .into_iter()
            .map(|(client_id, granted)| ForwardPublish {
                client_id,
                qos: message.qos.min(granted),
                message: message.clone(),
            })
            .collect()
    }
}

/// Generate a random identifier for clients that connect without one.
fn generate_client_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..32)
        .map(|_| CHARSET[rand::random_range(0..CHARSET.len())] as char)
        .collect()
}

impl PacketFlow for BrokerSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    fn handle_connect(&mut self, mut connect: Connect) -> SessionResult<PacketOutcome> {
        self.core.set_state(ConnectionState::Connecting);

        if !self
            .config
            .accepts_version(&connect.protocol_name, connect.protocol_level)
        {
            return Ok(self.refuse_connect(ConnectReturnCode::UnacceptableProtocolVersion));
        }
        if connect.client_id.is_empty() {
            if !connect.clean_session {
                // A session with no identity could never be resumed.
                return Ok(self.refuse_connect(ConnectReturnCode::IdentifierRejected));
            }
            connect.client_id = generate_client_id();
            debug!(client_id = %connect.client_id, "assigned generated client id");
        }
        if connect.client_id.len() > self.config.max_client_id_len {
            return Ok(self.refuse_connect(ConnectReturnCode::IdentifierRejected));
        }

        let credential_check = self.authority.authorize_connect(
            &connect.client_id,
            connect.username.as_deref(),
            connect.password.as_ref(),
        );
        if !credential_check.is_accepted() {
            return Ok(self.refuse_connect(credential_check));
        }

        if connect.clean_session && self.session_present {
            // Clean start discards whatever was resumed.
            self.subscriptions.clear();
            self.core.install_tracker(PacketIdTracker::new());
            self.session_present = false;
        }

        self.core.set_client_id(connect.client_id.clone());
        self.core.set_negotiated(
            Duration::from_secs(u64::from(connect.keep_alive)),
            connect.clean_session,
        );
        self.will = connect.will;
        self.core.set_state(ConnectionState::Connected);

        debug!(
            client_id = %connect.client_id,
            protocol = %connect.protocol_name,
            clean_session = connect.clean_session,
            keep_alive = connect.keep_alive,
            session_present = self.session_present,
            "connection accepted"
        );

        let mut outcome = PacketOutcome::respond(MqttPacket::ConnAck(ConnAck::accepted(
            self.session_present,
        )));
        outcome.events.push(SessionEvent::Connected {
            session_present: self.session_present,
        });
        Ok(outcome)
    }

    fn handle_publish(&mut self, publish: Publish) -> SessionResult<PacketOutcome> {
        match self.core.receive_publish(publish)? {
            ReceivedPublish::Deliver { message, ack } => {
                let mut outcome = PacketOutcome::none();
                outcome.forwards = self.fan_out(message);
                outcome.packets.extend(ack);
                Ok(outcome)
            }
            // QoS 2: routing waits for PUBREL.
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
        let mut outcome = PacketOutcome::none();
        if let Some(publish) = released {
            outcome.forwards = self.fan_out(ApplicationMessage::from_publish(&publish));
        }
        outcome.packets.push(ack);
        Ok(outcome)
    }

    fn handle_pubcomp(&mut self, pubcomp: PubComp) -> SessionResult<PacketOutcome> {
        self.core.apply_publish_ack(pubcomp.packet_id, PacketType::PubComp)
    }

    fn handle_subscribe(&mut self, subscribe: Subscribe) -> SessionResult<PacketOutcome> {
        if subscribe.subscriptions.is_empty() {
            return Err(SessionError::MalformedPacket(
                "SUBSCRIBE with no topic filters".to_string(),
            ));
        }

        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        for subscription in &subscribe.subscriptions {
            let at_capacity = self.subscriptions.len() >= self.config.max_subscriptions
                && !self.subscriptions.contains_key(&subscription.topic_filter);
            let code = if at_capacity {
                warn!(
                    client_id = %self.core.client_id(),
                    filter = %subscription.topic_filter,
                    limit = self.config.max_subscriptions,
                    "subscription limit reached, refusing filter"
                );
                SubscribeReturnCode::Failure
            } else {
                self.authority
                    .authorize_subscribe(self.core.client_id(), subscription)
            };

            if let Some(granted) = code.granted_qos() {
                self.subscriptions
                    .insert(subscription.topic_filter.clone(), granted);
            }
            return_codes.push(code);
        }

        Ok(PacketOutcome::respond(MqttPacket::SubAck(SubAck::new(
            subscribe.packet_id,
            return_codes,
        ))))
    }

    fn handle_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> SessionResult<PacketOutcome> {
        if unsubscribe.topics.is_empty() {
            return Err(SessionError::MalformedPacket(
                "UNSUBSCRIBE with no topic filters".to_string(),
            ));
        }

        for topic in &unsubscribe.topics {
            self.authority
                .remove_subscription(self.core.client_id(), topic);
            self.subscriptions.remove(topic);
        }

        // UNSUBACK goes out even when no filter matched.
        Ok(PacketOutcome::respond(MqttPacket::UnsubAck(UnsubAck::new(
            unsubscribe.packet_id,
        ))))
    }

    fn handle_disconnect(&mut self) -> SessionResult<PacketOutcome> {
        debug!(client_id = %self.core.client_id(), "clean disconnect");
        // A clean end never publishes the will.
        self.will = None;
        self.core.begin_termination(TerminateReason::NormalDisconnect);
        Ok(PacketOutcome::none().terminated(TerminateReason::NormalDisconnect))
    }
}
