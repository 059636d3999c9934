//! # MQTT Session Layer
//!
//! The session layer of an MQTT 3.1.1 endpoint: connection lifecycle,
//! packet-identifier tracking, and the QoS 0/1/2 acknowledgment
//! handshakes, for both the client and the broker side of a connection.
//!
//! ## Features
//!
//! - Packet-identifier allocation and in-flight tracking with
//!   backpressure when the identifier space is exhausted
//! - Role-agnostic session state machine with client and broker
//!   specializations
//! - Exactly-once (QoS 2) receive-side deduplication
//! - Keep-alive monitoring driven by an external timer tick
//! - Session registry with client-identifier takeover and persistent
//!   session resumption
//!
//! ## Architecture
//!
//! Packet framing, transport I/O, and topic-filter matching live outside
//! this crate: the transport hands decoded [`packet::MqttPacket`] values
//! to a session through [`session::PacketFlow::deliver_packet`] and
//! writes back the packets the session returns, in order. Broker sessions
//! delegate routing and authorization to the [`broker::PublishRouter`]
//! and [`broker::SubscriptionAuthority`] collaborators; the
//! [`registry::SessionRegistry`] owns all broker sessions of a process
//! and drives cross-session fan-out.

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod packet;
pub mod registry;
pub mod session;
pub mod tracker;
