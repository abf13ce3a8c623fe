//! Topic registry tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::*;
use crate::broker::{Connection, ConnectionRegistry};
use crate::codec::PacketDecoder;
use crate::protocol::{Packet, ProtocolVersion, Publish, QoS, Will};

struct TestClient {
    id: Arc<str>,
    conn: Arc<Connection>,
    rx: mpsc::Receiver<Bytes>,
}

impl TestClient {
    async fn recv(&mut self) -> Packet {
        let bytes = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("queue closed");
        let mut decoder = PacketDecoder::for_version(self.conn.protocol_version());
        decoder.decode_slice(&bytes).unwrap().unwrap().0
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(p) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    async fn assert_idle(&mut self) {
        let got = tokio::time::timeout(Duration::from_millis(100), self.rx.recv()).await;
        assert!(got.is_err(), "unexpected packet for {}", self.id);
    }
}

fn setup() -> (Arc<ConnectionRegistry>, TopicRegistry) {
    let connections = Arc::new(ConnectionRegistry::new());
    let topics = TopicRegistry::new(connections.clone(), 4, 16);
    (connections, topics)
}

fn connect(connections: &ConnectionRegistry, id: &str, version: ProtocolVersion) -> TestClient {
    static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
    let conn_id = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let (conn, rx) = Connection::new(conn_id, addr, 64);
    let id: Arc<str> = Arc::from(id);
    conn.bind(id.clone(), version, true);
    connections.insert(id.clone(), conn.clone());
    TestClient { id, conn, rx }
}

fn publish(topic: &str, payload: &'static [u8]) -> Publish {
    Publish::new(topic, Bytes::from_static(payload))
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_subscribe_is_idempotent() {
    let (connections, topics) = setup();
    let a = connect(&connections, "a", ProtocolVersion::V311);

    assert!(topics.subscribe("x/y", &a.id));
    assert!(!topics.subscribe("x/y", &a.id));
    assert_eq!(topics.subscribers("x/y"), vec![a.id.clone()]);
}

#[tokio::test]
async fn test_unsubscribe_drops_empty_filter() {
    let (connections, topics) = setup();
    let a = connect(&connections, "a", ProtocolVersion::V311);
    let b = connect(&connections, "b", ProtocolVersion::V311);

    topics.subscribe("x", &a.id);
    topics.subscribe("x", &b.id);
    topics.subscribe("y", &a.id);
    assert_eq!(topics.topics(), vec!["x", "y"]);

    assert!(topics.unsubscribe("x", "a"));
    assert!(!topics.unsubscribe("x", "a"));
    assert_eq!(topics.topics(), vec!["x", "y"]);

    assert!(topics.unsubscribe("x", "b"));
    assert_eq!(topics.topics(), vec!["y"]);
}

#[tokio::test]
async fn test_unsubscribe_all() {
    let (connections, topics) = setup();
    let a = connect(&connections, "a", ProtocolVersion::V311);
    let b = connect(&connections, "b", ProtocolVersion::V311);
    topics.subscribe("x", &a.id);
    topics.subscribe("y", &a.id);
    topics.subscribe("y", &b.id);

    topics.unsubscribe_all("a");
    assert_eq!(topics.topics(), vec!["y"]);
    assert_eq!(topics.subscribers("y"), vec![b.id.clone()]);
}

#[tokio::test]
async fn test_matching_clients_uses_wildcards() {
    let (connections, topics) = setup();
    let a = connect(&connections, "a", ProtocolVersion::V311);
    let b = connect(&connections, "b", ProtocolVersion::V311);
    let c = connect(&connections, "c", ProtocolVersion::V311);
    topics.subscribe("a/+/c", &a.id);
    topics.subscribe("a/b/#", &b.id);
    topics.subscribe("a/c", &c.id);

    let matched = topics.matching_clients("a/b/c");
    assert_eq!(matched.len(), 2);
    assert!(matched.contains(&a.id));
    assert!(matched.contains(&b.id));
}

#[tokio::test]
async fn test_system_topics_skip_leading_wildcards() {
    let (connections, topics) = setup();
    let a = connect(&connections, "a", ProtocolVersion::V311);
    let b = connect(&connections, "b", ProtocolVersion::V311);
    topics.subscribe("#", &a.id);
    topics.subscribe("$SYS/#", &b.id);

    let matched = topics.matching_clients("$SYS/uptime");
    assert_eq!(matched.len(), 1);
    assert!(matched.contains(&b.id));
}

#[tokio::test]
async fn test_deep_topics_match_by_scan() {
    let (connections, topics) = setup();
    let a = connect(&connections, "a", ProtocolVersion::V311);
    let b = connect(&connections, "b", ProtocolVersion::V311);
    let c = connect(&connections, "c", ProtocolVersion::V311);

    let deep = "l0/l1/l2/l3/l4/l5/l6/l7/l8/l9/l10/l11/l12/l13";
    assert!(matching::level_count(deep) > matching::EXPANSION_DEPTH_LIMIT);

    topics.subscribe("l0/#", &a.id);
    topics.subscribe("l0/+/l2/l3/l4/l5/l6/l7/l8/l9/l10/l11/l12/l13", &b.id);
    topics.subscribe("l0/l1/l2", &c.id);

    let matched = topics.matching_clients(deep);
    assert_eq!(matched.len(), 2);
    assert!(matched.contains(&a.id));
    assert!(matched.contains(&b.id));
}

// ============================================================================
// Fan-out
// ============================================================================

#[tokio::test]
async fn test_fanout_delivers_one_copy_per_client() {
    let (connections, topics) = setup();
    let mut a = connect(&connections, "a", ProtocolVersion::V311);
    let mut b = connect(&connections, "b", ProtocolVersion::V5);
    topics.subscribe("a/+/c", &a.id);
    topics.subscribe("a/b/#", &a.id);
    topics.subscribe("a/b/#", &b.id);

    topics.publish_fanout(publish("a/b/c", b"hello")).await;

    let got = a.recv_publish().await;
    assert_eq!(&*got.topic, "a/b/c");
    assert_eq!(got.payload, Bytes::from_static(b"hello"));
    assert_eq!(got.qos, QoS::AtMostOnce);
    assert_eq!(b.recv_publish().await.payload, Bytes::from_static(b"hello"));
    a.assert_idle().await;
    b.assert_idle().await;
}

#[tokio::test]
async fn test_fanout_keeps_order_per_topic() {
    let (connections, topics) = setup();
    let mut a = connect(&connections, "a", ProtocolVersion::V311);
    topics.subscribe("seq", &a.id);

    for i in 0..20u8 {
        topics
            .publish_fanout(Publish::new("seq", Bytes::from(vec![i])))
            .await;
    }
    for i in 0..20u8 {
        assert_eq!(a.recv_publish().await.payload, Bytes::from(vec![i]));
    }
}

#[tokio::test]
async fn test_fanout_skips_disconnected_subscribers() {
    let (connections, topics) = setup();
    let mut a = connect(&connections, "a", ProtocolVersion::V311);
    let gone: Arc<str> = Arc::from("gone");
    topics.subscribe("t", &a.id);
    topics.subscribe("t", &gone);

    assert_eq!(topics.deliver_now(&publish("t", b"x")).await, 1);
    a.recv_publish().await;
}

#[tokio::test]
async fn test_fanout_keeps_packet_id_for_qos1() {
    let (connections, topics) = setup();
    let mut a = connect(&connections, "a", ProtocolVersion::V311);
    topics.subscribe("t", &a.id);

    topics
        .publish_fanout(publish("t", b"x").with_qos(QoS::AtLeastOnce, Some(42)))
        .await;

    let got = a.recv_publish().await;
    assert_eq!(got.qos, QoS::AtLeastOnce);
    assert_eq!(got.packet_id, Some(42));
}

// ============================================================================
// Retained messages
// ============================================================================

#[tokio::test]
async fn test_retained_set_and_clear() {
    let (_connections, topics) = setup();

    topics.set_retained("t", Bytes::from_static(b"v1"));
    topics.set_retained("t", Bytes::from_static(b"v2"));
    assert_eq!(topics.retained("t"), Some(Bytes::from_static(b"v2")));
    assert_eq!(topics.retained_count(), 1);

    topics.set_retained("t", Bytes::new());
    assert_eq!(topics.retained("t"), None);
    assert_eq!(topics.retained_count(), 0);
}

#[tokio::test]
async fn test_push_retained_matches_exact_topic_only() {
    let (connections, topics) = setup();
    let mut a = connect(&connections, "a", ProtocolVersion::V311);
    topics.set_retained("a/b", Bytes::from_static(b"kept"));

    assert!(!topics.push_retained("a/+", &a.id).await);
    a.assert_idle().await;

    assert!(topics.push_retained("a/b", &a.id).await);
    let got = a.recv_publish().await;
    assert!(got.retain);
    assert_eq!(got.payload, Bytes::from_static(b"kept"));
}

// ============================================================================
// QoS 2 identifiers
// ============================================================================

#[tokio::test]
async fn test_qos2_ids_are_scoped_per_client() {
    let (_connections, topics) = setup();
    let a: Arc<str> = Arc::from("a");
    let b: Arc<str> = Arc::from("b");

    assert!(topics.set_qos2_id(&a, 7));
    assert!(!topics.set_qos2_id(&a, 7));
    assert!(topics.set_qos2_id(&b, 7));
    assert!(topics.has_qos2_id(&a, 7));

    assert!(topics.remove_qos2_id(&a, 7));
    assert!(!topics.has_qos2_id(&a, 7));
    assert!(topics.set_qos2_id(&a, 7));
}

#[tokio::test]
async fn test_release_qos2_ids() {
    let (_connections, topics) = setup();
    let a: Arc<str> = Arc::from("a");
    let b: Arc<str> = Arc::from("b");
    topics.set_qos2_id(&a, 1);
    topics.set_qos2_id(&a, 2);
    topics.set_qos2_id(&b, 1);

    assert_eq!(topics.release_qos2_ids("a"), 2);
    assert!(!topics.has_qos2_id(&a, 1));
    assert!(topics.has_qos2_id(&b, 1));
}

// ============================================================================
// Wills
// ============================================================================

fn will(topic: &str, payload: &'static [u8], retain: bool) -> Will {
    Will {
        topic: topic.to_string(),
        payload: Bytes::from_static(payload),
        qos: QoS::AtMostOnce,
        retain,
        properties: Default::default(),
    }
}

#[tokio::test]
async fn test_send_client_will_publishes_once_and_removes() {
    let (connections, topics) = setup();
    let mut watcher = connect(&connections, "watcher", ProtocolVersion::V311);
    let dying: Arc<str> = Arc::from("dying");
    topics.subscribe("status/#", &watcher.id);
    topics.set_will(&dying, 10, will("status/dying", b"offline", false));

    assert!(topics.send_client_will(&dying, 10).await);
    assert_eq!(
        watcher.recv_publish().await.payload,
        Bytes::from_static(b"offline")
    );
    assert!(topics.will(&dying, 10).is_none());

    assert!(!topics.send_client_will(&dying, 10).await);
    watcher.assert_idle().await;
}

#[tokio::test]
async fn test_wills_are_kept_per_connection() {
    let (_connections, topics) = setup();
    let id: Arc<str> = Arc::from("c");
    topics.set_will(&id, 1, will("t", b"old", false));
    topics.set_will(&id, 2, will("t", b"new", false));

    assert_eq!(
        topics.remove_will(&id, 1).map(|w| w.payload),
        Some(Bytes::from_static(b"old"))
    );
    assert!(!topics.send_client_will(&id, 1).await);
    assert_eq!(
        topics.will(&id, 2).unwrap().payload,
        Bytes::from_static(b"new")
    );
}

#[tokio::test]
async fn test_takeover_publishes_each_will_once() {
    let (connections, topics) = setup();
    let mut watcher = connect(&connections, "watcher", ProtocolVersion::V311);
    let id: Arc<str> = Arc::from("dev");
    topics.subscribe("status", &watcher.id);
    topics.set_will(&id, 1, will("status", b"old", false));
    topics.set_will(&id, 2, will("status", b"new", false));

    assert!(topics.send_client_will(&id, 1).await);
    assert_eq!(watcher.recv_publish().await.payload, Bytes::from_static(b"old"));
    watcher.assert_idle().await;

    assert!(topics.send_client_will(&id, 2).await);
    assert_eq!(watcher.recv_publish().await.payload, Bytes::from_static(b"new"));
}

#[tokio::test]
async fn test_retained_will_updates_retained_table() {
    let (_connections, topics) = setup();
    let id: Arc<str> = Arc::from("c");
    topics.set_will(&id, 1, will("last/c", b"gone", true));

    assert!(topics.send_client_will(&id, 1).await);
    assert_eq!(topics.retained("last/c"), Some(Bytes::from_static(b"gone")));
}
