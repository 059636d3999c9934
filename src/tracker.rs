//! Packet identifier allocation and in-flight handshake tracking.
//!
//! Every session owns one tracker. It manages two disjoint registries keyed
//! by 16-bit non-zero packet identifier:
//!
//! - *Outbound*: identifiers this endpoint allocated for its own QoS 1/2
//!   publishes and subscribe/unsubscribe requests, each bound to the
//!   original request and the handshake stage it is waiting on.
//! - *Inbound*: identifiers the peer used for QoS 2 publishes to this
//!   endpoint, holding the stored message between PUBLISH and PUBREL so a
//!   duplicate PUBLISH is recognized and not delivered twice.
//!
//! An identifier is never reused for a new outbound request while it is in
//! the outbound registry, and identifier 0 is never valid.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{SessionError, SessionResult};
use crate::packet::{
    MqttPacket, PacketType, PubRel, Publish, Subscribe, Subscription, Unsubscribe,
};

/// Handshake stage an outbound identifier is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStage {
    /// QoS 1 PUBLISH sent, awaiting PUBACK.
    AwaitingPuback,
    /// QoS 2 PUBLISH sent, awaiting PUBREC.
    AwaitingPubrec,
    /// PUBREL sent, awaiting PUBCOMP.
    AwaitingPubcomp,
    /// SUBSCRIBE sent, awaiting SUBACK.
    AwaitingSuback,
    /// UNSUBSCRIBE sent, awaiting UNSUBACK.
    AwaitingUnsuback,
}

impl OutboundStage {
    /// The acknowledgment packet type that advances this stage.
    fn expects(&self) -> PacketType {
        match self {
            Self::AwaitingPuback => PacketType::PubAck,
            Self::AwaitingPubrec => PacketType::PubRec,
            Self::AwaitingPubcomp => PacketType::PubComp,
            Self::AwaitingSuback => PacketType::SubAck,
            Self::AwaitingUnsuback => PacketType::UnsubAck,
        }
    }
}

/// The original request bound to an outbound identifier, kept for
/// retransmission and acknowledgment correlation.
#[derive(Debug, Clone)]
pub enum OutboundRequest {
    /// A QoS 1/2 publish.
    Publish(Publish),
    /// A subscribe request.
    Subscribe(Vec<Subscription>),
    /// An unsubscribe request.
    Unsubscribe(Vec<String>),
}

/// An outbound in-flight entry.
#[derive(Debug, Clone)]
pub struct OutboundEntry {
    /// Stage the handshake is waiting on.
    pub stage: OutboundStage,
    /// The original request.
    pub request: OutboundRequest,
    /// When the current stage was entered.
    pub registered_at: Instant,
    /// Delivery attempts so far (1 = initial send).
    pub attempts: u32,
}

/// What the session should do after an acknowledgment advanced an
/// outbound entry.
#[derive(Debug, Clone)]
pub enum NextAction {
    /// QoS 1 handshake finished; the identifier is free again.
    PublishAcked {
        /// The released identifier.
        packet_id: u16,
    },
    /// QoS 2: PUBREC consumed, reply with PUBREL.
    SendPubrel(PubRel),
    /// QoS 2 handshake finished; the identifier is free again.
    PublishComplete {
        /// The released identifier.
        packet_id: u16,
    },
    /// SUBACK consumed; carries the requested filters so the caller can
    /// correlate per-filter return codes.
    SubscribeAcked {
        /// The released identifier.
        packet_id: u16,
        /// The filters from the original SUBSCRIBE, in request order.
        requested: Vec<Subscription>,
    },
    /// UNSUBACK consumed; carries the filters that were removed.
    UnsubscribeAcked {
        /// The released identifier.
        packet_id: u16,
        /// The filters from the original UNSUBSCRIBE.
        topics: Vec<String>,
    },
}

/// Per-session packet identifier tracker.
#[derive(Debug, Clone)]
pub struct PacketIdTracker {
    /// Outbound in-flight entries.
    outbound: HashMap<u16, OutboundEntry>,
    /// Inbound QoS 2 publishes awaiting PUBREL, with the stored message.
    inbound: HashMap<u16, Publish>,
    /// Allocation cursor; the next candidate identifier.
    next_id: u16,
}

impl Default for PacketIdTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            next_id: 1,
        }
    }

    /// Allocate the next free outbound identifier.
    ///
    /// Scans upward from the cursor through 1..=65535, wrapping, and fails
    /// only when every identifier is in flight. The returned identifier is
    /// not yet bound; call [`register_outbound`](Self::register_outbound)
    /// before handing the packet to the transport.
    pub fn allocate(&mut self) -> SessionResult<u16> {
        if self.outbound.len() >= usize::from(u16::MAX) {
            warn!(
                in_flight = self.outbound.len(),
                "packet identifier space exhausted"
            );
            return Err(SessionError::IdentifierSpaceExhausted);
        }

        loop {
            let id = self.next_id;
            self.next_id = if self.next_id == u16::MAX {
                1
            } else {
                self.next_id + 1
            };
            if !self.outbound.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Bind an allocated identifier to a pending request and the stage its
    /// handshake starts in. The identifier must not already be in flight.
    pub fn register_outbound(
        &mut self,
        packet_id: u16,
        stage: OutboundStage,
        request: OutboundRequest,
    ) -> SessionResult<()> {
        if packet_id == 0 {
            return Err(SessionError::MalformedPacket(
                "packet identifier 0 is reserved".to_string(),
            ));
        }
        if self.outbound.contains_key(&packet_id) {
            return Err(SessionError::DuplicateIdentifier(packet_id));
        }

        self.outbound.insert(
            packet_id,
            OutboundEntry {
                stage,
                request,
                registered_at: Instant::now(),
                attempts: 1,
            },
        );
        Ok(())
    }

    /// Validate an inbound acknowledgment against the registered stage and
    /// advance the handshake.
    ///
    /// An acknowledgment for an unregistered identifier, or one that does
    /// not match the stage and request the identifier is registered with,
    /// is a protocol violation and leaves the entry untouched.
    pub fn advance_outbound(
        &mut self,
        packet_id: u16,
        ack: PacketType,
    ) -> SessionResult<NextAction> {
        let entry = self.outbound.remove(&packet_id).ok_or_else(|| {
            SessionError::ProtocolViolation(format!(
                "{ack} for identifier {packet_id} which is not in flight"
            ))
        })?;

        if entry.stage.expects() != ack {
            let stage = entry.stage;
            // The mismatched entry stays registered, untouched.
            self.outbound.insert(packet_id, entry);
            return Err(SessionError::ProtocolViolation(format!(
                "{ack} for identifier {packet_id} in stage {stage:?}"
            )));
        }

        match (entry.stage, entry.request) {
            (OutboundStage::AwaitingPuback, _) => Ok(NextAction::PublishAcked { packet_id }),
            (OutboundStage::AwaitingPubrec, request) => {
                self.outbound.insert(
                    packet_id,
                    OutboundEntry {
                        stage: OutboundStage::AwaitingPubcomp,
                        request,
                        registered_at: Instant::now(),
                        attempts: entry.attempts,
                    },
                );
                Ok(NextAction::SendPubrel(PubRel::new(packet_id)))
            }
            (OutboundStage::AwaitingPubcomp, _) => Ok(NextAction::PublishComplete { packet_id }),
            (OutboundStage::AwaitingSuback, OutboundRequest::Subscribe(requested)) => {
                Ok(NextAction::SubscribeAcked {
                    packet_id,
                    requested,
                })
            }
            (OutboundStage::AwaitingUnsuback, OutboundRequest::Unsubscribe(topics)) => {
                Ok(NextAction::UnsubscribeAcked { packet_id, topics })
            }
            (stage, request) => {
                // Stage/request pairings no registration path produces;
                // keep the entry registered like any other violation.
                self.outbound.insert(
                    packet_id,
                    OutboundEntry {
                        stage,
                        request,
                        registered_at: entry.registered_at,
                        attempts: entry.attempts,
                    },
                );
                Err(SessionError::ProtocolViolation(format!(
                    "{ack} for identifier {packet_id} mismatches the request in stage {stage:?}"
                )))
            }
        }
    }

    /// Drop an outbound entry without an acknowledgment.
    pub fn release_outbound(&mut self, packet_id: u16) -> Option<OutboundEntry> {
        self.outbound.remove(&packet_id)
    }

    /// Record an inbound QoS 2 publish awaiting PUBREL. The message is held
    /// so delivery can happen at PUBREL time.
    pub fn register_inbound(&mut self, packet_id: u16, publish: Publish) {
        self.inbound.insert(packet_id, publish);
    }

    /// Whether the peer already sent a QoS 2 publish with this identifier
    /// that we have not yet released.
    pub fn is_duplicate_inbound(&self, packet_id: u16) -> bool {
        self.inbound.contains_key(&packet_id)
    }

    /// Release an inbound registration, returning the stored message for
    /// application delivery.
    pub fn release_inbound(&mut self, packet_id: u16) -> Option<Publish> {
        self.inbound.remove(&packet_id)
    }

    /// Outbound identifiers that have been waiting in their current stage
    /// for at least `after`, as of `now`. Retry policy lives with the
    /// caller; this is only the query.
    pub fn stalled(&self, now: Instant, after: Duration) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .outbound
            .iter()
            .filter(|(_, entry)| {
                now.checked_duration_since(entry.registered_at)
                    .map(|waited| waited >= after)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Rebuild the retransmission packet for an in-flight identifier:
    /// the original PUBLISH with the dup flag set, the pending PUBREL, or
    /// the original SUBSCRIBE/UNSUBSCRIBE. Returns `None` when the
    /// identifier is no longer in flight (already acknowledged).
    pub fn retransmit_packet(&mut self, packet_id: u16) -> Option<MqttPacket> {
        let entry = self.outbound.get_mut(&packet_id)?;
        entry.attempts += 1;

        match (&entry.stage, &mut entry.request) {
            (
                OutboundStage::AwaitingPuback | OutboundStage::AwaitingPubrec,
                OutboundRequest::Publish(publish),
            ) => {
                publish.dup = true;
                Some(MqttPacket::Publish(publish.clone()))
            }
            (OutboundStage::AwaitingPubcomp, _) => {
                Some(MqttPacket::PubRel(PubRel::new(packet_id)))
            }
            (OutboundStage::AwaitingSuback, OutboundRequest::Subscribe(subs)) => Some(
                MqttPacket::Subscribe(Subscribe::new(packet_id, subs.clone())),
            ),
            (OutboundStage::AwaitingUnsuback, OutboundRequest::Unsubscribe(topics)) => Some(
                MqttPacket::Unsubscribe(Unsubscribe::new(packet_id, topics.clone())),
            ),
            _ => None,
        }
    }

    /// Stage of an outbound identifier, if in flight.
    pub fn outbound_stage(&self, packet_id: u16) -> Option<OutboundStage> {
        self.outbound.get(&packet_id).map(|e| e.stage)
    }

    /// Number of outbound identifiers in flight.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Number of inbound QoS 2 registrations.
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Whether nothing is in flight in either direction.
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }

    /// Discard all in-flight state, for a clean-start session.
    pub fn reset(&mut self) {
        self.outbound.clear();
        self.inbound.clear();
        self.next_id = 1;
    }
}
