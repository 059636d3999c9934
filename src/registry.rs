//! Session registry: the client identifier to active session mapping for
//! one broker process.
//!
//! The registry enforces the protocol's takeover rule during admission (an
//! accepted CONNECT for an identifier with a live session retires the old
//! session before the new one is registered; a refused CONNECT displaces
//! nothing), parks the state of persistent sessions for resumption,
//! publishes will messages on abnormal ends, and drives the fan-out legs
//! that broker sessions produce so each subscriber runs its own
//! sender-side handshake.
//!
//! Each session is still driven by one logical thread of control; the
//! registry locks the map only around individual operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::broker::{BrokerSession, PublishRouter, SubscriptionAuthority};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::packet::{Connect, MqttPacket, QoS, Will};
use crate::session::{
    ApplicationMessage, ForwardPublish, PacketFlow, PacketOutcome, TerminateReason,
};
use crate::tracker::PacketIdTracker;

/// State a persistent session leaves behind for the next connection with
/// the same identifier.
#[derive(Debug)]
struct ParkedSession {
    subscriptions: HashMap<String, QoS>,
    tracker: PacketIdTracker,
}

/// Owner of all broker sessions in one process.
pub struct SessionRegistry {
    config: SessionConfig,
    router: Arc<dyn PublishRouter>,
    authority: Arc<dyn SubscriptionAuthority>,
    active: RwLock<HashMap<String, BrokerSession>>,
    parked: RwLock<HashMap<String, ParkedSession>>,
}

impl SessionRegistry {
    /// Create an empty registry sharing one router and authority across
    /// all sessions.
    pub fn new(
        config: SessionConfig,
        router: Arc<dyn PublishRouter>,
        authority: Arc<dyn SubscriptionAuthority>,
    ) -> Self {
        Self {
            config,
            router,
            authority,
            active: RwLock::new(HashMap::new()),
            parked: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a connection: complete the CONNECT handshake and, once it is
    /// accepted, run takeover on any prior session with the same
    /// identifier and resume parked state for a persistent reconnect.
    ///
    /// The handshake is validated before anything is displaced: a refused
    /// CONNECT leaves nothing registered and touches neither the live
    /// session nor the parked state under its identifier. Will legs from
    /// a taken over session ride along in `forwards`.
    pub async fn admit(&self, connect: Connect) -> SessionResult<PacketOutcome> {
        let client_id = connect.client_id.clone();

        let mut session = BrokerSession::new(
            self.config.clone(),
            Arc::clone(&self.router),
            Arc::clone(&self.authority),
        );
        if !connect.clean_session {
            if let Some(resumed) = self.resumable_state(&client_id).await {
                debug!(
                    client_id = %client_id,
                    subscriptions = resumed.subscriptions.len(),
                    in_flight = resumed.tracker.outbound_len(),
                    "resuming persistent session"
                );
                session.install_resumed(resumed.subscriptions, resumed.tracker);
            }
        }

        let mut outcome = session.deliver_packet(MqttPacket::Connect(connect))?;
        if outcome.terminate.is_some() {
            return Ok(outcome);
        }

        if let Some(prior) = self.active.write().await.remove(&client_id) {
            warn!(
                client_id = %client_id,
                "duplicate client identifier, terminating prior session"
            );
            let legs = self.retire_session(prior, TerminateReason::TakenOver).await;
            outcome.forwards.extend(legs);
        }
        // The new session owns whatever state it resumed; the parked copy
        // (including one the retired session just left) is stale now. A
        // clean start discards parked state the same way.
        self.parked.write().await.remove(&client_id);

        // The handshake may have assigned a generated identifier, so
        // register under the session's own id rather than the request's.
        let assigned = session.core().client_id().to_string();
        self.active.write().await.insert(assigned, session);
        Ok(outcome)
    }

    /// Clone the state a persistent CONNECT would resume: the live
    /// session's if one is registered, otherwise whatever is parked.
    /// Reads only, so a handshake that ends up refused perturbs nothing.
    async fn resumable_state(&self, client_id: &str) -> Option<ParkedSession> {
        if let Some(live) = self.active.read().await.get(client_id) {
            if !live.core().clean_session() {
                return Some(ParkedSession {
                    subscriptions: live.subscriptions().clone(),
                    tracker: live.core().tracker().clone(),
                });
            }
            return None;
        }
        self.parked
            .read()
            .await
            .get(client_id)
            .map(|parked| ParkedSession {
                subscriptions: parked.subscriptions.clone(),
                tracker: parked.tracker.clone(),
            })
    }

    /// Hand a decoded packet to the session for `client_id`.
    ///
    /// When the outcome signals termination the session is retired here
    /// (parked if persistent, will published if abnormal) and its will
    /// legs are appended to `forwards`. On a fatal `Err` the session
    /// stays registered in its latched state; the transport must follow
    /// up with [`unregister`](Self::unregister).
    pub async fn deliver(
        &self,
        client_id: &str,
        packet: MqttPacket,
    ) -> SessionResult<PacketOutcome> {
        let mut active = self.active.write().await;
        let session = active
            .get_mut(client_id)
            .ok_or(SessionError::SessionNotEstablished)?;

        let mut outcome = session.deliver_packet(packet)?;
        if let Some(reason) = outcome.terminate.clone() {
            if let Some(session) = active.remove(client_id) {
                let legs = self.retire_session(session, reason).await;
                outcome.forwards.extend(legs);
            }
        }
        Ok(outcome)
    }

    /// Terminate and remove a session. Idempotent: a second call for the
    /// same identifier returns `None`. Abnormal reasons publish the will;
    /// the returned outcome carries those legs.
    pub async fn unregister(
        &self,
        client_id: &str,
        reason: TerminateReason,
    ) -> Option<PacketOutcome> {
        let session = self.active.write().await.remove(client_id)?;
        let legs = self.retire_session(session, reason.clone()).await;
        let mut outcome = PacketOutcome::none().terminated(reason);
        outcome.forwards = legs;
        Some(outcome)
    }

    /// Run the keep-alive check over every session. Expired sessions are
    /// retired; the returned outcomes tell each transport what to write
    /// or that its connection is done.
    pub async fn on_tick(&self, now: Instant) -> Vec<(String, PacketOutcome)> {
        let mut results: Vec<(String, PacketOutcome)> = Vec::new();
        let mut active = self.active.write().await;

        for (client_id, session) in active.iter_mut() {
            let outcome = session.on_tick(now);
            if !outcome.packets.is_empty() || outcome.terminate.is_some() {
                results.push((client_id.clone(), outcome));
            }
        }

        for (client_id, outcome) in results.iter_mut() {
            if let Some(reason) = outcome.terminate.clone() {
                if let Some(session) = active.remove(client_id) {
                    let legs = self.retire_session(session, reason).await;
                    outcome.forwards.extend(legs);
                }
            }
        }

        results
    }

    /// Drive fan-out legs: each target session builds its own outbound
    /// PUBLISH with an identifier from its own tracker. Legs to unknown
    /// sessions are dropped; a backpressured subscriber (identifier space
    /// exhausted) loses the leg with a warning, retry policy being the
    /// caller's business.
    pub async fn fan_out(&self, forwards: &[ForwardPublish]) -> Vec<(String, MqttPacket)> {
        let mut deliveries = Vec::with_capacity(forwards.len());
        let mut active = self.active.write().await;

        for leg in forwards {
            let Some(session) = active.get_mut(&leg.client_id) else {
                debug!(client_id = %leg.client_id, "dropping fan-out leg for unknown session");
                continue;
            };
            match session.forward_publish(&leg.message, leg.qos) {
                Ok(packet) => deliveries.push((leg.client_id.clone(), packet)),
                Err(SessionError::IdentifierSpaceExhausted) => {
                    warn!(
                        client_id = %leg.client_id,
                        topic = %leg.message.topic,
                        "subscriber identifier space exhausted, dropping leg"
                    );
                }
                Err(err) => {
                    warn!(
                        client_id = %leg.client_id,
                        error = %err,
                        "fan-out leg failed"
                    );
                }
            }
        }

        deliveries
    }

    /// Rebuild the retransmission packets for every exchange that has been
    /// waiting in its current stage for at least `after`, as of `now`:
    /// dup-flagged PUBLISHes, pending PUBRELs. Resumed in-flight entries
    /// become re-deliverable here as soon as the session is back. Run this
    /// on the same timer as [`on_tick`](Self::on_tick); the interval is
    /// the caller's retry policy.
    pub async fn retransmit_stalled(
        &self,
        now: Instant,
        after: Duration,
    ) -> Vec<(String, MqttPacket)> {
        let mut resends = Vec::new();
        let mut active = self.active.write().await;

        for (client_id, session) in active.iter_mut() {
            for packet_id in session.core().stalled(now, after) {
                if let Some(packet) = session.core_mut().retransmit(packet_id) {
                    debug!(
                        client_id = %client_id,
                        packet_id,
                        "retransmitting stalled exchange"
                    );
                    resends.push((client_id.clone(), packet));
                }
            }
        }

        resends
    }

    /// Whether a live session exists for `client_id`.
    pub async fn contains(&self, client_id: &str) -> bool {
        self.active.read().await.contains_key(client_id)
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Park persistent state, finish the session, and build will legs
    /// for an abnormal end.
    async fn retire_session(
        &self,
        mut session: BrokerSession,
        reason: TerminateReason,
    ) -> Vec<ForwardPublish> {
        let client_id = session.core().client_id().to_string();

        if !session.core().clean_session() {
            let (subscriptions, tracker) = session.park();
            debug!(
                client_id = %client_id,
                subscriptions = subscriptions.len(),
                in_flight = tracker.outbound_len(),
                "parking persistent session state"
            );
            self.parked.write().await.insert(
                client_id.clone(),
                ParkedSession {
                    subscriptions,
                    tracker,
                },
            );
        }

        session.core_mut().terminate(reason.clone());

        if reason.is_abnormal() {
            if let Some(will) = session.take_will() {
                return self.route_will(&client_id, will);
            }
        }
        Vec::new()
    }

    fn route_will(&self, client_id: &str, will: Will) -> Vec<ForwardPublish> {
        debug!(client_id = %client_id, topic = %will.topic, "publishing will message");
        let message = ApplicationMessage {
            topic: will.topic,
            payload: will.payload,
            qos: will.qos,
            retain: will.retain,
        };
        self.router
            .route_publish(&message.topic, &message.payload, message.qos, message.retain)
            .into_iter()
            .map(|(client_id, granted)| ForwardPublish {
                client_id,
                qos: message.qos.min(granted),
                message: message.clone(),
            })
            .collect()
    }
}
