//! Publish fan-out pool
//!
//! Publishes are sharded over a fixed set of workers by a hash of the topic
//! name, so publishes to one topic keep their order while fan-out cost stays
//! off the publisher's inbound loop. Each worker resolves the subscriber set,
//! encodes the packet once per protocol version and enqueues it on every
//! matched connection. A full shard queue blocks the submitter and a full
//! outbound queue blocks the worker.

use std::sync::Arc;

use ahash::RandomState;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::Subscriptions;
use crate::broker::ConnectionRegistry;
use crate::codec::PacketEncoder;
use crate::protocol::{Packet, ProtocolVersion, Publish};

pub struct FanoutPool {
    shards: Vec<mpsc::Sender<Publish>>,
    hasher: RandomState,
}

impl FanoutPool {
    /// Spawn `size` workers with `capacity` queued publishes each.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(
        size: usize,
        capacity: usize,
        subscriptions: Arc<Subscriptions>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        let shards = (0..size.max(1))
            .map(|worker| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                tokio::spawn(run_worker(
                    worker,
                    rx,
                    subscriptions.clone(),
                    connections.clone(),
                ));
                tx
            })
            .collect();

        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, topic: &str) -> usize {
        (self.hasher.hash_one(topic) % self.shards.len() as u64) as usize
    }

    /// Queue `publish` for delivery; waits while the topic's shard is full
    pub async fn submit(&self, publish: Publish) {
        let shard = self.shard(&publish.topic);
        if self.shards[shard].send(publish).await.is_err() {
            warn!("fan-out worker {} is gone, publish dropped", shard);
        }
    }
}

async fn run_worker(
    worker: usize,
    mut rx: mpsc::Receiver<Publish>,
    subscriptions: Arc<Subscriptions>,
    connections: Arc<ConnectionRegistry>,
) {
    while let Some(publish) = rx.recv().await {
        let delivered = deliver(&publish, &subscriptions, &connections).await;
        trace!(
            "fan-out worker {} delivered {} to {} subscribers",
            worker,
            publish.topic,
            delivered
        );
    }
    debug!("fan-out worker {} stopped", worker);
}

/// Per-version wire form, encoded on first use
struct EncodedPublish<'a> {
    packet: Packet,
    publish: &'a Publish,
    v311: Option<Bytes>,
    v5: Option<Bytes>,
}

impl<'a> EncodedPublish<'a> {
    fn new(publish: &'a Publish) -> Self {
        Self {
            packet: Packet::Publish(publish.clone()),
            publish,
            v311: None,
            v5: None,
        }
    }

    fn get(&mut self, version: ProtocolVersion) -> Option<Bytes> {
        let slot = match version {
            ProtocolVersion::V311 => &mut self.v311,
            ProtocolVersion::V5 => &mut self.v5,
        };
        if slot.is_none() {
            match PacketEncoder::new(version).to_bytes(&self.packet) {
                Ok(bytes) => *slot = Some(bytes),
                Err(e) => {
                    warn!("cannot encode publish to {}: {}", self.publish.topic, e);
                    return None;
                }
            }
        }
        slot.clone()
    }
}

/// Deliver one publish to every matching connection, one copy per client.
/// Returns the number of connections it was queued on.
pub(crate) async fn deliver(
    publish: &Publish,
    subscriptions: &Subscriptions,
    connections: &ConnectionRegistry,
) -> usize {
    let clients = subscriptions.matching(&publish.topic);
    let mut encoded = EncodedPublish::new(publish);
    let mut delivered = 0;

    for client_id in clients {
        let Some(conn) = connections.get(&client_id) else {
            continue;
        };
        let Some(bytes) = encoded.get(conn.protocol_version()) else {
            return delivered;
        };
        match conn.send(bytes).await {
            Ok(()) => delivered += 1,
            Err(_) => trace!("subscriber {} closed before delivery", client_id),
        }
    }
    delivered
}
