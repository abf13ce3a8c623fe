//! Integration tests for the TideMQ broker
//!
//! Each test starts a broker on an ephemeral port and drives it with raw TCP
//! clients built on the crate's own codec.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use tidemq::admin::{AdminApi, AdminServer, PublishMsg, CODE_OK};
use tidemq::broker::{Broker, BrokerConfig};
use tidemq::codec::{PacketDecoder, PacketEncoder};
use tidemq::hooks::StaticCredentials;
use tidemq::protocol::{
    Ack, ConnAck, Connect, Disconnect, Packet, ProtocolVersion, Publish, QoS, ReasonCode,
    Subscribe, Subscription, SubscriptionOptions, Unsubscribe, Will,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(3);
const QUIET: Duration = Duration::from_millis(300);

fn test_config() -> BrokerConfig {
    BrokerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..BrokerConfig::default()
    }
}

async fn start(config: BrokerConfig) -> (Broker, SocketAddr) {
    let broker = Broker::new(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = broker.clone();
    tokio::spawn(async move { server.serve(listener).await });
    (broker, addr)
}

struct TestClient {
    stream: TcpStream,
    encoder: PacketEncoder,
    decoder: PacketDecoder,
    buf: BytesMut,
    version: ProtocolVersion,
}

impl TestClient {
    async fn open(addr: SocketAddr, version: ProtocolVersion) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        Self {
            stream,
            encoder: PacketEncoder::new(version),
            decoder: PacketDecoder::for_version(version),
            buf: BytesMut::new(),
            version,
        }
    }

    /// Open, CONNECT and expect a successful CONNACK
    async fn connected(addr: SocketAddr, version: ProtocolVersion, client_id: &str) -> Self {
        let mut client = Self::open(addr, version).await;
        let ack = client.connect(Connect::new(version, client_id)).await;
        assert_eq!(ack.reason_code, ReasonCode::Success);
        client
    }

    async fn connect(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let bytes = self.encoder.to_bytes(packet).expect("encode failed");
        self.send_raw(&bytes).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write failed");
    }

    /// Next packet, or None on EOF or timeout
    async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        loop {
            if let Some((packet, used)) = self.decoder.decode_slice(&self.buf).expect("bad packet") {
                self.buf.advance(used);
                return Some(packet);
            }
            let mut chunk = [0u8; 4096];
            match timeout(wait, self.stream.read(&mut chunk)).await {
                Ok(Ok(n)) if n > 0 => self.buf.extend_from_slice(&chunk[..n]),
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(RECV_TIMEOUT).await
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(p)) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    async fn assert_quiet(&mut self) {
        if let Some(packet) = self.recv_within(QUIET).await {
            panic!("unexpected packet {:?}", packet);
        }
    }

    /// True once the broker has closed the transport
    async fn closed(&mut self) -> bool {
        let mut chunk = [0u8; 256];
        loop {
            match timeout(RECV_TIMEOUT, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn subscribe(&mut self, packet_id: u16, filters: &[&str]) {
        let subscribe = Subscribe {
            packet_id,
            subscriptions: filters
                .iter()
                .map(|f| Subscription {
                    filter: f.to_string(),
                    options: SubscriptionOptions::with_qos(QoS::AtMostOnce),
                })
                .collect(),
            properties: Default::default(),
        };
        self.send(&Packet::Subscribe(subscribe)).await;
        match self.recv().await {
            Some(Packet::SubAck(ack)) => {
                assert_eq!(ack.packet_id, packet_id);
                assert_eq!(ack.reason_codes.len(), filters.len());
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, publish: Publish) {
        self.send(&Packet::Publish(publish)).await;
    }

    async fn ping(&mut self) {
        self.send(&Packet::PingReq).await;
        assert_eq!(self.recv().await, Some(Packet::PingResp));
    }
}

fn will(topic: &str, payload: &'static [u8]) -> Will {
    Will {
        topic: topic.to_string(),
        payload: Bytes::from_static(payload),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: Default::default(),
    }
}

// ============================================================================
// Connect handshake
// ============================================================================

#[tokio::test]
async fn test_connect_and_ping_v311() {
    let (broker, addr) = start(test_config()).await;
    let mut client = TestClient::connected(addr, ProtocolVersion::V311, "c1").await;
    client.ping().await;
    assert_eq!(broker.client_ids(), vec!["c1"]);
}

#[tokio::test]
async fn test_connect_and_ping_v5() {
    let (_broker, addr) = start(test_config()).await;
    let mut client = TestClient::connected(addr, ProtocolVersion::V5, "c5").await;
    client.ping().await;
}

#[tokio::test]
async fn test_verifier_refusal_v5_echoes_code() {
    let (broker, addr) = start(test_config()).await;
    broker.set_connect_verifier(Arc::new(|_: &Connect| ReasonCode::Banned));

    let mut client = TestClient::open(addr, ProtocolVersion::V5).await;
    let ack = client
        .connect(Connect::new(ProtocolVersion::V5, "nope"))
        .await;
    assert_eq!(ack.reason_code, ReasonCode::Banned);
    assert!(client.closed().await);
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_verifier_refusal_v311_maps_code() {
    let (broker, addr) = start(test_config()).await;
    broker.set_connect_verifier(Arc::new(|_: &Connect| ReasonCode::Banned));

    let mut client = TestClient::open(addr, ProtocolVersion::V311).await;
    let ack = client
        .connect(Connect::new(ProtocolVersion::V311, "nope"))
        .await;
    assert_eq!(ack.reason_code, ReasonCode::NotAuthorized);
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_v5_only_refusal_code_still_answers_v311() {
    let (broker, addr) = start(test_config()).await;
    broker.set_connect_verifier(Arc::new(|_: &Connect| ReasonCode::QuotaExceeded));

    let mut client = TestClient::open(addr, ProtocolVersion::V311).await;
    client
        .send(&Packet::Connect(Box::new(Connect::new(ProtocolVersion::V311, "q"))))
        .await;
    let mut response = Vec::new();
    timeout(RECV_TIMEOUT, client.stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    // Server unavailable
    assert_eq!(response, vec![0x20, 0x02, 0x00, 0x03]);
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_reserved_connect_flag_gets_connack() {
    let (broker, addr) = start(test_config()).await;
    let mut client = TestClient::open(addr, ProtocolVersion::V311).await;

    // Level 4, flags 0x03 (clean session + reserved bit), client id "c"
    client
        .send_raw(&[
            0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x03, 0x00, 0x3C, 0x00, 0x01,
            b'c',
        ])
        .await;

    let mut response = Vec::new();
    timeout(RECV_TIMEOUT, client.stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, vec![0x20, 0x02, 0x00, 0x01]);
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_static_credentials_verifier() {
    let (broker, addr) = start(test_config()).await;
    broker.set_connect_verifier(Arc::new(StaticCredentials::new("admin", "s3cret")));

    let mut client = TestClient::open(addr, ProtocolVersion::V311).await;
    let ack = client
        .connect(Connect::new(ProtocolVersion::V311, "anon"))
        .await;
    assert_eq!(ack.reason_code, ReasonCode::BadUserNameOrPassword);
    assert!(client.closed().await);

    let mut client = TestClient::open(addr, ProtocolVersion::V311).await;
    let mut connect = Connect::new(ProtocolVersion::V311, "ops");
    connect.username = Some("admin".to_string());
    connect.password = Some(Bytes::from_static(b"s3cret"));
    assert_eq!(client.connect(connect).await.reason_code, ReasonCode::Success);
    client.ping().await;
}

#[tokio::test]
async fn test_unsupported_protocol_level() {
    let (_broker, addr) = start(test_config()).await;
    let mut client = TestClient::open(addr, ProtocolVersion::V311).await;

    // Protocol level 3, client id "c"
    client
        .send_raw(&[
            0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x03, 0x02, 0x00, 0x3C, 0x00, 0x01,
            b'c',
        ])
        .await;

    let mut response = Vec::new();
    timeout(RECV_TIMEOUT, client.stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, vec![0x20, 0x02, 0x00, 0x01]);
}

#[tokio::test]
async fn test_first_packet_must_be_connect() {
    let (broker, addr) = start(test_config()).await;
    let mut client = TestClient::open(addr, ProtocolVersion::V311).await;

    client.send(&Packet::PingReq).await;
    assert!(client.closed().await);
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_max_connections() {
    let (_broker, addr) = start(BrokerConfig {
        max_connections: 1,
        ..test_config()
    })
    .await;
    let mut first = TestClient::connected(addr, ProtocolVersion::V5, "first").await;

    let mut second = TestClient::open(addr, ProtocolVersion::V5).await;
    let ack = second
        .connect(Connect::new(ProtocolVersion::V5, "second"))
        .await;
    assert_eq!(ack.reason_code, ReasonCode::ServerUnavailable);
    assert!(second.closed().await);

    first.ping().await;
}

#[tokio::test]
async fn test_connect_timeout() {
    let (_broker, addr) = start(BrokerConfig {
        connect_timeout: Duration::from_millis(200),
        ..test_config()
    })
    .await;
    let mut client = TestClient::open(addr, ProtocolVersion::V311).await;
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_keep_alive_closes_idle_connection() {
    let (broker, addr) = start(BrokerConfig {
        keep_alive: Duration::from_millis(300),
        ..test_config()
    })
    .await;
    let mut client = TestClient::connected(addr, ProtocolVersion::V311, "idle").await;
    assert!(client.closed().await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_oversize_packet_closes_connection() {
    let (_broker, addr) = start(BrokerConfig {
        max_packet_size: 64,
        ..test_config()
    })
    .await;
    let mut client = TestClient::connected(addr, ProtocolVersion::V311, "big").await;

    client
        .publish(Publish::new("t", Bytes::from(vec![0u8; 256])))
        .await;
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_takeover_stops_older_connection() {
    let (broker, addr) = start(test_config()).await;
    let mut old = TestClient::connected(addr, ProtocolVersion::V311, "dup").await;
    let mut new = TestClient::connected(addr, ProtocolVersion::V311, "dup").await;

    assert!(old.closed().await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.client_ids(), vec!["dup"]);
    new.ping().await;
}

#[tokio::test]
async fn test_clean_takeover_starts_a_fresh_session() {
    let (broker, addr) = start(test_config()).await;
    let mut old = TestClient::connected(addr, ProtocolVersion::V311, "dev").await;
    old.subscribe(1, &["cmd/dev"]).await;
    let qos2 = Publish::new("t", Bytes::from_static(b"x")).with_qos(QoS::ExactlyOnce, Some(1));
    old.publish(qos2.clone()).await;
    assert_eq!(old.recv().await, Some(Packet::PubRec(Ack::new(1))));

    let mut new = TestClient::connected(addr, ProtocolVersion::V311, "dev").await;
    assert!(old.closed().await);
    assert!(broker.topics().subscribers("cmd/dev").is_empty());

    // Same id, no PUBREL in between: a new QoS 2 exchange, not a duplicate
    new.publish(qos2).await;
    assert_eq!(new.recv().await, Some(Packet::PubRec(Ack::new(1))));

    let mut ops = TestClient::connected(addr, ProtocolVersion::V311, "ops").await;
    ops.publish(Publish::new("cmd/dev", Bytes::from_static(b"reboot")))
        .await;
    new.assert_quiet().await;
}

// ============================================================================
// Publish flows
// ============================================================================

#[tokio::test]
async fn test_qos0_delivery() {
    let (_broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connected(addr, ProtocolVersion::V311, "sub").await;
    let mut publisher = TestClient::connected(addr, ProtocolVersion::V5, "pub").await;
    sub.subscribe(1, &["sensors/+/temp"]).await;

    publisher
        .publish(Publish::new("sensors/1/temp", Bytes::from_static(b"21.5")))
        .await;

    let got = sub.recv_publish().await;
    assert_eq!(&*got.topic, "sensors/1/temp");
    assert_eq!(got.payload, Bytes::from_static(b"21.5"));
    publisher.assert_quiet().await;
}

#[tokio::test]
async fn test_qos1_publish_is_acked() {
    let (_broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connected(addr, ProtocolVersion::V311, "sub").await;
    let mut publisher = TestClient::connected(addr, ProtocolVersion::V311, "pub").await;
    sub.subscribe(1, &["t"]).await;

    publisher
        .publish(Publish::new("t", Bytes::from_static(b"x")).with_qos(QoS::AtLeastOnce, Some(10)))
        .await;

    assert_eq!(publisher.recv().await, Some(Packet::PubAck(Ack::new(10))));
    let got = sub.recv_publish().await;
    assert_eq!(got.qos, QoS::AtMostOnce);
}

#[tokio::test]
async fn test_qos2_flow_and_duplicate() {
    let (_broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connected(addr, ProtocolVersion::V311, "sub").await;
    let mut publisher = TestClient::connected(addr, ProtocolVersion::V311, "pub").await;
    sub.subscribe(1, &["t"]).await;

    let qos2 = Publish::new("t", Bytes::from_static(b"once")).with_qos(QoS::ExactlyOnce, Some(3));
    publisher.publish(qos2.clone()).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(Ack::new(3))));
    assert_eq!(sub.recv_publish().await.payload, Bytes::from_static(b"once"));

    publisher.publish(qos2).await;
    assert!(publisher.closed().await);
    sub.assert_quiet().await;
}

#[tokio::test]
async fn test_qos2_pubrel_releases_id() {
    let (_broker, addr) = start(test_config()).await;
    let mut publisher = TestClient::connected(addr, ProtocolVersion::V311, "pub").await;
    let qos2 = Publish::new("t", Bytes::from_static(b"x")).with_qos(QoS::ExactlyOnce, Some(8));

    publisher.publish(qos2.clone()).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(Ack::new(8))));
    publisher.send(&Packet::PubRel(Ack::new(8))).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubComp(Ack::new(8))));

    publisher.publish(qos2).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(Ack::new(8))));
}

#[tokio::test]
async fn test_qos2_ids_are_per_client() {
    let (_broker, addr) = start(test_config()).await;
    let mut a = TestClient::connected(addr, ProtocolVersion::V311, "a").await;
    let mut b = TestClient::connected(addr, ProtocolVersion::V311, "b").await;
    let qos2 = Publish::new("t", Bytes::from_static(b"x")).with_qos(QoS::ExactlyOnce, Some(1));

    a.publish(qos2.clone()).await;
    b.publish(qos2).await;
    assert_eq!(a.recv().await, Some(Packet::PubRec(Ack::new(1))));
    assert_eq!(b.recv().await, Some(Packet::PubRec(Ack::new(1))));
}

#[tokio::test]
async fn test_overlapping_filters_deliver_once() {
    let (_broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connected(addr, ProtocolVersion::V5, "sub").await;
    let mut publisher = TestClient::connected(addr, ProtocolVersion::V5, "pub").await;
    sub.subscribe(1, &["a/+/c", "a/b/#", "#"]).await;

    publisher
        .publish(Publish::new("a/b/c", Bytes::from_static(b"1")))
        .await;

    sub.recv_publish().await;
    sub.assert_quiet().await;
}

#[tokio::test]
async fn test_per_topic_ordering() {
    let (_broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connected(addr, ProtocolVersion::V311, "sub").await;
    let mut publisher = TestClient::connected(addr, ProtocolVersion::V311, "pub").await;
    sub.subscribe(1, &["seq"]).await;

    for i in 0..100u32 {
        publisher
            .publish(Publish::new("seq", Bytes::from(i.to_be_bytes().to_vec())))
            .await;
    }
    for i in 0..100u32 {
        let got = sub.recv_publish().await;
        assert_eq!(got.payload, Bytes::from(i.to_be_bytes().to_vec()));
    }
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connected(addr, ProtocolVersion::V5, "sub").await;
    let mut publisher = TestClient::connected(addr, ProtocolVersion::V311, "pub").await;
    sub.subscribe(1, &["t"]).await;

    sub.send(&Packet::Unsubscribe(Unsubscribe {
        packet_id: 2,
        filters: vec!["t".to_string()],
        properties: Default::default(),
    }))
    .await;
    match sub.recv().await {
        Some(Packet::UnsubAck(ack)) => assert_eq!(ack.reason_codes, vec![ReasonCode::Success]),
        other => panic!("expected UNSUBACK, got {:?}", other),
    }
    assert!(broker.topic_list().is_empty());

    publisher
        .publish(Publish::new("t", Bytes::from_static(b"x")))
        .await;
    sub.assert_quiet().await;
}

// ============================================================================
// Retained messages
// ============================================================================

#[tokio::test]
async fn test_retained_set_and_clear() {
    let (_broker, addr) = start(test_config()).await;
    let mut publisher = TestClient::connected(addr, ProtocolVersion::V311, "pub").await;

    publisher
        .publish(Publish::new("state", Bytes::from_static(b"on")).with_retain(true))
        .await;
    publisher.ping().await;

    let mut late = TestClient::connected(addr, ProtocolVersion::V311, "late").await;
    late.subscribe(1, &["state"]).await;
    let got = late.recv_publish().await;
    assert!(got.retain);
    assert_eq!(got.payload, Bytes::from_static(b"on"));

    publisher
        .publish(Publish::new("state", Bytes::new()).with_retain(true))
        .await;
    publisher.ping().await;

    let mut later = TestClient::connected(addr, ProtocolVersion::V311, "later").await;
    later.subscribe(1, &["state"]).await;
    later.assert_quiet().await;
}

// ============================================================================
// Wills
// ============================================================================

#[tokio::test]
async fn test_will_published_on_abnormal_close() {
    let (_broker, addr) = start(test_config()).await;
    let mut watcher = TestClient::connected(addr, ProtocolVersion::V311, "watcher").await;
    watcher.subscribe(1, &["status/#"]).await;

    let mut dying = TestClient::open(addr, ProtocolVersion::V311).await;
    let mut connect = Connect::new(ProtocolVersion::V311, "dying");
    connect.will = Some(will("status/dying", b"offline"));
    assert_eq!(dying.connect(connect).await.reason_code, ReasonCode::Success);
    drop(dying);

    let got = watcher.recv_publish().await;
    assert_eq!(&*got.topic, "status/dying");
    assert_eq!(got.payload, Bytes::from_static(b"offline"));
}

#[tokio::test]
async fn test_will_discarded_on_disconnect() {
    let (_broker, addr) = start(test_config()).await;
    let mut watcher = TestClient::connected(addr, ProtocolVersion::V311, "watcher").await;
    watcher.subscribe(1, &["status/#"]).await;

    let mut leaving = TestClient::open(addr, ProtocolVersion::V311).await;
    let mut connect = Connect::new(ProtocolVersion::V311, "leaving");
    connect.will = Some(will("status/leaving", b"offline"));
    leaving.connect(connect).await;
    leaving
        .send(&Packet::Disconnect(Disconnect::default()))
        .await;
    assert!(leaving.closed().await);

    watcher.assert_quiet().await;
}

#[tokio::test]
async fn test_takeover_publishes_old_will_only() {
    let (_broker, addr) = start(test_config()).await;
    let mut watcher = TestClient::connected(addr, ProtocolVersion::V311, "watcher").await;
    watcher.subscribe(1, &["status/#"]).await;

    let mut old = TestClient::open(addr, ProtocolVersion::V311).await;
    let mut connect = Connect::new(ProtocolVersion::V311, "dev");
    connect.will = Some(will("status/dev", b"old"));
    old.connect(connect).await;

    let mut new = TestClient::open(addr, ProtocolVersion::V311).await;
    let mut connect = Connect::new(ProtocolVersion::V311, "dev");
    connect.will = Some(will("status/dev", b"new"));
    new.connect(connect).await;
    assert!(old.closed().await);

    assert_eq!(watcher.recv_publish().await.payload, Bytes::from_static(b"old"));
    watcher.assert_quiet().await;

    drop(new);
    assert_eq!(watcher.recv_publish().await.payload, Bytes::from_static(b"new"));
}

// ============================================================================
// Broker operations
// ============================================================================

#[tokio::test]
async fn test_broker_publish_qos1_allocates_packet_id() {
    let (broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connected(addr, ProtocolVersion::V5, "sub").await;
    sub.subscribe(1, &["cmd/#"]).await;

    let api = AdminApi::new(broker.clone());
    let mut msg = PublishMsg::new("cmd/reboot", "now");
    msg.qos = 1;
    assert_eq!(api.send_publish(msg).await.code, CODE_OK);

    let got = sub.recv_publish().await;
    assert_eq!(got.qos, QoS::AtLeastOnce);
    let packet_id = got.packet_id.expect("QoS 1 publish carries an id");
    assert_ne!(packet_id, 0);
    sub.send(&Packet::PubAck(Ack::new(packet_id))).await;
    sub.ping().await;
}

#[tokio::test]
async fn test_broker_publish_qos2_gets_pubrel() {
    let (broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connected(addr, ProtocolVersion::V311, "sub").await;
    sub.subscribe(1, &["t"]).await;

    broker
        .publish("t", Bytes::from_static(b"x"), QoS::ExactlyOnce)
        .await;
    let got = sub.recv_publish().await;
    let packet_id = got.packet_id.unwrap();

    sub.send(&Packet::PubRec(Ack::new(packet_id))).await;
    assert_eq!(sub.recv().await, Some(Packet::PubRel(Ack::new(packet_id))));
}

#[tokio::test]
async fn test_stop_connection() {
    let (broker, addr) = start(test_config()).await;
    let mut client = TestClient::connected(addr, ProtocolVersion::V311, "victim").await;
    let api = AdminApi::new(broker.clone());

    assert_eq!(api.stop_connection("victim").code, CODE_OK);
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_broker_stop_closes_everything() {
    let (broker, addr) = start(test_config()).await;
    let mut a = TestClient::connected(addr, ProtocolVersion::V311, "a").await;
    let mut b = TestClient::connected(addr, ProtocolVersion::V5, "b").await;

    broker.stop();
    assert!(a.closed().await);
    assert!(b.closed().await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_admin_http_info() {
    let (broker, addr) = start(test_config()).await;
    let _client = TestClient::connected(addr, ProtocolVersion::V311, "c").await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = listener.local_addr().unwrap();
    tokio::spawn(AdminServer::new(AdminApi::new(broker.clone()), admin_addr).serve(listener));

    let mut http = TcpStream::connect(admin_addr).await.unwrap();
    http.write_all(b"GET /connections HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    timeout(RECV_TIMEOUT, http.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains(r#""data":["c"]"#), "{}", response);
}

#[tokio::test]
async fn test_client_version_is_kept_per_connection() {
    let (_broker, addr) = start(test_config()).await;
    let mut v3 = TestClient::connected(addr, ProtocolVersion::V311, "v3").await;
    let mut v5 = TestClient::connected(addr, ProtocolVersion::V5, "v5").await;
    v3.subscribe(1, &["mixed"]).await;
    v5.subscribe(1, &["mixed"]).await;

    let mut publisher = TestClient::connected(addr, ProtocolVersion::V5, "pub").await;
    publisher
        .publish(Publish::new("mixed", Bytes::from_static(b"m")))
        .await;

    assert_eq!(v3.version, ProtocolVersion::V311);
    assert_eq!(v3.recv_publish().await.payload, Bytes::from_static(b"m"));
    assert_eq!(v5.recv_publish().await.payload, Bytes::from_static(b"m"));
}
