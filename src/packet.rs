//! MQTT 3.1.1 control packet model.
//!
//! The session layer consumes and produces already-decoded packet values;
//! framing to and from byte buffers belongs to the transport layer. Each
//! packet type is an immutable value object carrying the protocol fields
//! the state machines act on: packet identifier, QoS, retain/dup flags,
//! topic, payload, and return codes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SessionError, SessionResult};

/// Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    AtMostOnce = 0,
    /// At least once delivery (acknowledged).
    AtLeastOnce = 1,
    /// Exactly once delivery (four-way handshake).
    ExactlyOnce = 2,
}

impl QoS {
    /// Create QoS from byte value.
    pub fn from_u8(value: u8) -> SessionResult<Self> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            _ => Err(SessionError::MalformedPacket(format!(
                "invalid QoS level: {value}"
            ))),
        }
    }
}

/// MQTT control packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client request to connect.
    Connect = 1,
    /// Connection acknowledgment.
    ConnAck = 2,
    /// Publish message.
    Publish = 3,
    /// Publish acknowledgment (QoS 1).
    PubAck = 4,
    /// Publish received (QoS 2, step 1).
    PubRec = 5,
    /// Publish release (QoS 2, step 2).
    PubRel = 6,
    /// Publish complete (QoS 2, step 3).
    PubComp = 7,
    /// Subscribe request.
    Subscribe = 8,
    /// Subscribe acknowledgment.
    SubAck = 9,
    /// Unsubscribe request.
    Unsubscribe = 10,
    /// Unsubscribe acknowledgment.
    UnsubAck = 11,
    /// Ping request.
    PingReq = 12,
    /// Ping response.
    PingResp = 13,
    /// Disconnect notification.
    Disconnect = 14,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "CONNECT",
            Self::ConnAck => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::PubAck => "PUBACK",
            Self::PubRec => "PUBREC",
            Self::PubRel => "PUBREL",
            Self::PubComp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::SubAck => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::UnsubAck => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

/// CONNACK return codes (MQTT 3.1.1, table 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    Accepted = 0x00,
    /// The server does not support the requested protocol level.
    UnacceptableProtocolVersion = 0x01,
    /// The client identifier is not allowed by the server.
    IdentifierRejected = 0x02,
    /// The network connection was made but the service is unavailable.
    ServerUnavailable = 0x03,
    /// The data in the username or password is malformed.
    BadUsernameOrPassword = 0x04,
    /// The client is not authorized to connect.
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    /// Check whether the connection was accepted.
    pub fn is_accepted(&self) -> bool {
        *self == Self::Accepted
    }
}

/// SUBACK return codes (MQTT 3.1.1): the granted QoS per filter, or a
/// failure marker for a filter the server refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscribeReturnCode {
    /// Subscription accepted at QoS 0.
    SuccessQoS0 = 0x00,
    /// Subscription accepted at QoS 1.
    SuccessQoS1 = 0x01,
    /// Subscription accepted at QoS 2.
    SuccessQoS2 = 0x02,
    /// Subscription refused.
    Failure = 0x80,
}

impl SubscribeReturnCode {
    /// Return code granting the given QoS.
    pub fn granted(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Self::SuccessQoS0,
            QoS::AtLeastOnce => Self::SuccessQoS1,
            QoS::ExactlyOnce => Self::SuccessQoS2,
        }
    }

    /// The granted QoS, or `None` for a refused filter.
    pub fn granted_qos(&self) -> Option<QoS> {
        match self {
            Self::SuccessQoS0 => Some(QoS::AtMostOnce),
            Self::SuccessQoS1 => Some(QoS::AtLeastOnce),
            Self::SuccessQoS2 => Some(QoS::ExactlyOnce),
            Self::Failure => None,
        }
    }
}

/// MQTT packet.
#[derive(Debug, Clone, PartialEq)]
pub enum MqttPacket {
    /// CONNECT packet.
    Connect(Connect),
    /// CONNACK packet.
    ConnAck(ConnAck),
    /// PUBLISH packet.
    Publish(Publish),
    /// PUBACK packet.
    PubAck(PubAck),
    /// PUBREC packet.
    PubRec(PubRec),
    /// PUBREL packet.
    PubRel(PubRel),
    /// PUBCOMP packet.
    PubComp(PubComp),
    /// SUBSCRIBE packet.
    Subscribe(Subscribe),
    /// SUBACK packet.
    SubAck(SubAck),
    /// UNSUBSCRIBE packet.
    Unsubscribe(Unsubscribe),
    /// UNSUBACK packet.
    UnsubAck(UnsubAck),
    /// PINGREQ packet.
    PingReq,
    /// PINGRESP packet.
    PingResp,
    /// DISCONNECT packet.
    Disconnect,
}

impl MqttPacket {
    /// Get the packet type.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    /// The packet identifier this packet carries, if its type carries one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Self::Publish(p) => p.packet_id,
            Self::PubAck(p) => Some(p.packet_id),
            Self::PubRec(p) => Some(p.packet_id),
            Self::PubRel(p) => Some(p.packet_id),
            Self::PubComp(p) => Some(p.packet_id),
            Self::Subscribe(p) => Some(p.packet_id),
            Self::SubAck(p) => Some(p.packet_id),
            Self::Unsubscribe(p) => Some(p.packet_id),
            Self::UnsubAck(p) => Some(p.packet_id),
            _ => None,
        }
    }
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    /// Protocol name ("MQTT" for 3.1.1, "MQIsdp" for 3.1).
    pub protocol_name: String,
    /// Protocol level (4 for 3.1.1, 3 for 3.1).
    pub protocol_level: u8,
    /// Clean session flag.
    pub clean_session: bool,
    /// Will message.
    pub will: Option<Will>,
    /// Username.
    pub username: Option<String>,
    /// Password.
    pub password: Option<Bytes>,
    /// Keep alive interval in seconds (0 disables keep-alive).
    pub keep_alive: u16,
    /// Client identifier.
    pub client_id: String,
}

impl Connect {
    /// Create a CONNECT with 3.1.1 defaults: clean session, 60s keep-alive,
    /// no credentials, no will.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            clean_session: true,
            will: None,
            username: None,
            password: None,
            keep_alive: 60,
            client_id: client_id.into(),
        }
    }
}

/// Will message, published by the broker on abnormal client disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Will {
    /// Topic.
    pub topic: String,
    /// Payload.
    pub payload: Bytes,
    /// QoS level.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
}

/// CONNACK packet.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnAck {
    /// Session present flag.
    pub session_present: bool,
    /// Return code.
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    /// Create an accepting CONNACK.
    pub fn accepted(session_present: bool) -> Self {
        Self {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        }
    }

    /// Create a refusing CONNACK. Session present must be 0 on refusal.
    pub fn refused(return_code: ConnectReturnCode) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    /// Duplicate delivery flag.
    pub dup: bool,
    /// QoS level.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
    /// Topic name.
    pub topic: String,
    /// Packet identifier (for QoS > 0).
    pub packet_id: Option<u16>,
    /// Payload.
    pub payload: Bytes,
}

impl Publish {
    /// Create a new QoS 0 PUBLISH.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    /// Set QoS and packet identifier.
    pub fn with_qos(mut self, qos: QoS, packet_id: u16) -> Self {
        self.qos = qos;
        if qos != QoS::AtMostOnce {
            self.packet_id = Some(packet_id);
        }
        self
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// PUBACK packet (QoS 1 acknowledgment).
#[derive(Debug, Clone, PartialEq)]
pub struct PubAck {
    /// Packet identifier.
    pub packet_id: u16,
}

impl PubAck {
    /// Create a PUBACK for the given identifier.
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

/// PUBREC packet (QoS 2, step 1).
#[derive(Debug, Clone, PartialEq)]
pub struct PubRec {
    /// Packet identifier.
    pub packet_id: u16,
}

impl PubRec {
    /// Create a PUBREC for the given identifier.
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

/// PUBREL packet (QoS 2, step 2).
#[derive(Debug, Clone, PartialEq)]
pub struct PubRel {
    /// Packet identifier.
    pub packet_id: u16,
}

impl PubRel {
    /// Create a PUBREL for the given identifier.
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

/// PUBCOMP packet (QoS 2, step 3).
#[derive(Debug, Clone, PartialEq)]
pub struct PubComp {
    /// Packet identifier.
    pub packet_id: u16,
}

impl PubComp {
    /// Create a PUBCOMP for the given identifier.
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

/// A single subscription request: topic filter plus requested QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic filter.
    pub topic_filter: String,
    /// Requested maximum QoS.
    pub qos: QoS,
}

impl Subscription {
    /// Create a subscription request.
    pub fn new(topic_filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos,
        }
    }
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    /// Packet identifier.
    pub packet_id: u16,
    /// Requested subscriptions.
    pub subscriptions: Vec<Subscription>,
}

impl Subscribe {
    /// Create a SUBSCRIBE for the given filters.
    pub fn new(packet_id: u16, subscriptions: Vec<Subscription>) -> Self {
        Self {
            packet_id,
            subscriptions,
        }
    }
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    /// Packet identifier.
    pub packet_id: u16,
    /// Per-filter return codes, in request order.
    pub return_codes: Vec<SubscribeReturnCode>,
}

impl SubAck {
    /// Create a SUBACK with the given return codes.
    pub fn new(packet_id: u16, return_codes: Vec<SubscribeReturnCode>) -> Self {
        Self {
            packet_id,
            return_codes,
        }
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    /// Packet identifier.
    pub packet_id: u16,
    /// Topic filters to remove.
    pub topics: Vec<String>,
}

impl Unsubscribe {
    /// Create an UNSUBSCRIBE for the given filters.
    pub fn new(packet_id: u16, topics: Vec<String>) -> Self {
        Self { packet_id, topics }
    }
}

/// UNSUBACK packet.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsubAck {
    /// Packet identifier.
    pub packet_id: u16,
}

impl UnsubAck {
    /// Create an UNSUBACK for the given identifier.
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}
