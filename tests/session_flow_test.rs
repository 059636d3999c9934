//! End-to-end session flows: a client session talking to a broker-side
//! session registry, with the tests shuttling the packets both directions
//! the way a transport would.

use bytes::Bytes;
use mqtt_session::broker::{PublishRouter, SubscriptionAuthority};
use mqtt_session::client::{ClientSession, ConnectOptions};
use mqtt_session::config::SessionConfig;
use mqtt_session::error::SessionError;
use mqtt_session::packet::{
    Connect, MqttPacket, PubComp, QoS, SubscribeReturnCode, Subscription,
};
use mqtt_session::registry::SessionRegistry;
use mqtt_session::session::{PacketFlow, PacketOutcome, SessionEvent, TerminateReason};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Exact-match router over a fixed topic -> targets table.
#[derive(Default)]
struct TableRouter {
    targets: HashMap<String, Vec<(String, QoS)>>,
}

impl TableRouter {
    fn with_target(topic: &str, client_id: &str, granted: QoS) -> Arc<Self> {
        let mut targets = HashMap::new();
        targets.insert(topic.to_string(), vec![(client_id.to_string(), granted)]);
        Arc::new(Self { targets })
    }
}

impl PublishRouter for TableRouter {
    fn route_publish(
        &self,
        topic: &str,
        _payload: &Bytes,
        _qos: QoS,
        _retain: bool,
    ) -> Vec<(String, QoS)> {
        self.targets.get(topic).cloned().unwrap_or_default()
    }
}

/// Authority granting every request at the requested QoS.
struct OpenAuthority;

impl SubscriptionAuthority for OpenAuthority {
    fn authorize_subscribe(
        &self,
        _client_id: &str,
        subscription: &Subscription,
    ) -> SubscribeReturnCode {
        SubscribeReturnCode::granted(subscription.qos)
    }

    fn remove_subscription(&self, _client_id: &str, _topic_filter: &str) {}
}

fn registry_with_router(router: Arc<dyn PublishRouter>) -> SessionRegistry {
    SessionRegistry::new(SessionConfig::default(), router, Arc::new(OpenAuthority))
}

/// Run the CONNECT/CONNACK handshake for a fresh client against the
/// registry.
async fn connect_client(registry: &SessionRegistry, client_id: &str) -> ClientSession {
    let mut client = ClientSession::new(client_id, ConnectOptions::default());
    let connect = match client.connect().unwrap() {
        MqttPacket::Connect(connect) => connect,
        other => panic!("unexpected {other:?}"),
    };
    let outcome = registry.admit(connect).await.unwrap();
    for packet in outcome.packets {
        client.deliver_packet(packet).unwrap();
    }
    assert!(client.core().is_connected());
    client
}

fn only_packet(outcome: PacketOutcome) -> MqttPacket {
    let mut packets = outcome.packets;
    assert_eq!(packets.len(), 1, "expected exactly one outbound packet");
    packets.remove(0)
}

#[tokio::test]
async fn test_qos2_publish_travels_end_to_end_exactly_once() {
    let router = TableRouter::with_target("sensors/temp", "sub", QoS::ExactlyOnce);
    let registry = registry_with_router(router);

    let mut publisher = connect_client(&registry, "pub").await;
    let mut subscriber = connect_client(&registry, "sub").await;

    // Publisher half: PUBLISH -> PUBREC -> PUBREL -> PUBCOMP.
    let publish = publisher
        .publish("sensors/temp", "21.5", QoS::ExactlyOnce, false)
        .unwrap();
    let outcome = registry.deliver("pub", publish).await.unwrap();
    // Nothing is routed until the publisher releases the message.
    assert!(outcome.forwards.is_empty());
    let pubrec = only_packet(outcome);

    let pubrel = only_packet(publisher.deliver_packet(pubrec).unwrap());
    let outcome = registry.deliver("pub", pubrel).await.unwrap();
    assert_eq!(outcome.forwards.len(), 1);
    let forwards = outcome.forwards.clone();
    let pubcomp = only_packet(outcome);
    publisher.deliver_packet(pubcomp).unwrap();
    assert_eq!(publisher.core().outbound_in_flight(), 0);

    // Subscriber half: the broker-side forward runs its own QoS 2
    // handshake in the subscriber's identifier space.
    let deliveries = registry.fan_out(&forwards).await;
    assert_eq!(deliveries.len(), 1);
    let (target, forwarded) = deliveries.into_iter().next().unwrap();
    assert_eq!(target, "sub");

    let pubrec = only_packet(subscriber.deliver_packet(forwarded).unwrap());
    let pubrel = only_packet(registry.deliver("sub", pubrec).await.unwrap());

    let mut outcome = subscriber.deliver_packet(pubrel).unwrap();
    assert_eq!(outcome.packets.len(), 1);
    let pubcomp = outcome.packets.remove(0);
    // Exactly one application delivery, at PUBREL time.
    match outcome.events.as_slice() {
        [SessionEvent::MessageReceived(message)] => {
            assert_eq!(message.topic, "sensors/temp");
            assert_eq!(message.payload, Bytes::from_static(b"21.5"));
            assert_eq!(message.qos, QoS::ExactlyOnce);
        }
        other => panic!("unexpected events {other:?}"),
    }

    registry.deliver("sub", pubcomp).await.unwrap();
}

#[tokio::test]
async fn test_qos1_retransmission_routes_twice_and_acks_both() {
    let router = TableRouter::with_target("alerts", "sub", QoS::AtLeastOnce);
    let registry = registry_with_router(router);
    let mut publisher = connect_client(&registry, "pub").await;
    connect_client(&registry, "sub").await;

    let publish = publisher.publish("alerts", "hot", QoS::AtLeastOnce, false).unwrap();
    let packet_id = publish.packet_id().unwrap();
    let first = registry.deliver("pub", publish).await.unwrap();
    assert_eq!(first.forwards.len(), 1);

    // The PUBACK got lost; the caller retransmits with the dup flag and
    // the same identifier. At-least-once: the broker routes it again.
    let retransmit = publisher.core_mut().retransmit(packet_id).unwrap();
    match &retransmit {
        MqttPacket::Publish(p) => {
            assert!(p.dup);
            assert_eq!(p.packet_id, Some(packet_id));
        }
        other => panic!("unexpected {other:?}"),
    }
    let second = registry.deliver("pub", retransmit).await.unwrap();
    assert_eq!(second.forwards.len(), 1);

    // The first PUBACK releases the identifier.
    publisher.deliver_packet(only_packet(first)).unwrap();
    assert_eq!(publisher.core().outbound_in_flight(), 0);

    // The duplicate PUBACK no longer matches anything in flight, which
    // the session treats as a protocol violation rather than ignoring.
    let err = publisher.deliver_packet(only_packet(second)).unwrap_err();
    assert!(matches!(err, SessionError::ProtocolViolation(_)));
}

#[tokio::test]
async fn test_subscribe_roundtrip_records_grant() {
    let registry = registry_with_router(Arc::new(TableRouter::default()));
    let mut client = connect_client(&registry, "c1").await;

    let subscribe = client
        .subscribe(vec![Subscription::new("a/b", QoS::AtLeastOnce)])
        .unwrap();
    let suback = only_packet(registry.deliver("c1", subscribe).await.unwrap());

    let outcome = client.deliver_packet(suback).unwrap();
    assert!(matches!(
        outcome.events.as_slice(),
        [SessionEvent::SubscribeCompleted { grants, .. }]
            if grants.len() == 1 && grants[0].granted == Some(QoS::AtLeastOnce)
    ));
    assert_eq!(client.subscriptions().get("a/b"), Some(&QoS::AtLeastOnce));
}

#[tokio::test]
async fn test_keep_alive_ping_pong_keeps_session_alive() {
    let registry = registry_with_router(Arc::new(TableRouter::default()));
    let mut client = connect_client(&registry, "c1").await;

    // A full keep-alive interval of client send silence produces the
    // ping; the broker answers it.
    let base = client.core().last_outbound();
    let pingreq = only_packet(client.on_tick(base + Duration::from_secs(60)));
    assert!(matches!(pingreq, MqttPacket::PingReq));

    let pingresp = only_packet(registry.deliver("c1", pingreq).await.unwrap());
    assert!(matches!(pingresp, MqttPacket::PingResp));
    client.deliver_packet(pingresp).unwrap();

    // The response refreshed peer liveness: well past the original
    // deadline the session is still healthy.
    let refreshed = client.core().last_inbound();
    let outcome = client.on_tick(refreshed + Duration::from_secs(89));
    assert!(outcome.terminate.is_none());

    // Without any further traffic the 1.5x cutoff still applies.
    let outcome = client.on_tick(refreshed + Duration::from_secs(90));
    assert_eq!(outcome.terminate, Some(TerminateReason::KeepAliveExpired));
}

#[tokio::test]
async fn test_broker_side_violation_requires_unregister() {
    let registry = registry_with_router(Arc::new(TableRouter::default()));
    connect_client(&registry, "c1").await;

    // An acknowledgment for an identifier never used is fatal.
    let err = registry
        .deliver("c1", MqttPacket::PubComp(PubComp::new(40)))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ProtocolViolation(_)));

    // The latched session is still registered until the transport closes.
    assert!(registry.contains("c1").await);
    let outcome = registry
        .unregister("c1", TerminateReason::TransportClosed)
        .await
        .unwrap();
    assert_eq!(outcome.terminate, Some(TerminateReason::TransportClosed));
    assert!(!registry.contains("c1").await);
}

#[tokio::test]
async fn test_takeover_completes_new_handshake() {
    let registry = registry_with_router(Arc::new(TableRouter::default()));
    connect_client(&registry, "dev-7").await;

    // Same identifier connects again; the accepted handshake evicts the
    // old session before the new CONNACK reaches the transport.
    let second = connect_client(&registry, "dev-7").await;
    assert!(second.core().is_connected());
    assert_eq!(registry.session_count().await, 1);
}

#[tokio::test]
async fn test_clean_session_resubscribes_from_scratch() {
    let registry = registry_with_router(Arc::new(TableRouter::default()));
    let mut client = connect_client(&registry, "c1").await;

    let subscribe = client
        .subscribe(vec![Subscription::new("a/b", QoS::AtMostOnce)])
        .unwrap();
    let suback = only_packet(registry.deliver("c1", subscribe).await.unwrap());
    client.deliver_packet(suback).unwrap();

    registry
        .unregister("c1", TerminateReason::TransportClosed)
        .await
        .unwrap();

    // Clean session: the reconnect starts with no server-side state.
    let mut connect = Connect::new("c1");
    connect.clean_session = true;
    let outcome = registry.admit(connect).await.unwrap();
    match outcome.packets.as_slice() {
        [MqttPacket::ConnAck(connack)] => assert!(!connack.session_present),
        other => panic!("unexpected {other:?}"),
    }
}
