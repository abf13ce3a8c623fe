//! Topic registry
//!
//! Owns all broker-wide topic state, each table behind its own lock:
//! - subscriptions: filter -> set of client ids
//! - retained messages: exact topic -> last payload
//! - QoS 2 identifiers received but not yet released
//! - last wills of bound clients
//!
//! Locks are held only for the map operation, never across an await.
//! Clients are referenced by id and resolved through the
//! [`ConnectionRegistry`] at delivery time.

mod fanout;
pub mod matching;

#[cfg(test)]
mod tests;

pub use fanout::FanoutPool;
pub use matching::{candidate_filters, topic_matches_filter, validate_topic_name};

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::broker::ConnectionRegistry;
use crate::codec::PacketEncoder;
use crate::protocol::{Packet, Publish, Will};

/// Subscription table shared with the fan-out workers
#[derive(Default)]
pub struct Subscriptions {
    filters: RwLock<AHashMap<String, AHashSet<Arc<str>>>>,
}

impl Subscriptions {
    /// Returns true if the client was not yet subscribed to `filter`
    pub fn insert(&self, filter: &str, client_id: &Arc<str>) -> bool {
        self.filters
            .write()
            .entry(filter.to_string())
            .or_default()
            .insert(client_id.clone())
    }

    pub fn remove(&self, filter: &str, client_id: &str) -> bool {
        let mut filters = self.filters.write();
        let Some(clients) = filters.get_mut(filter) else {
            return false;
        };
        let removed = clients.remove(client_id);
        if clients.is_empty() {
            filters.remove(filter);
        }
        removed
    }

    /// Drop every subscription held by `client_id`
    pub fn remove_client(&self, client_id: &str) {
        self.filters.write().retain(|_, clients| {
            clients.remove(client_id);
            !clients.is_empty()
        });
    }

    /// Distinct clients with at least one filter matching `topic`
    pub fn matching(&self, topic: &str) -> AHashSet<Arc<str>> {
        let filters = self.filters.read();
        let mut clients = AHashSet::new();

        if matching::level_count(topic) > matching::EXPANSION_DEPTH_LIMIT {
            for (filter, subscribers) in filters.iter() {
                if topic_matches_filter(topic, filter) {
                    clients.extend(subscribers.iter().cloned());
                }
            }
        } else {
            for candidate in candidate_filters(topic) {
                if let Some(subscribers) = filters.get(&candidate) {
                    clients.extend(subscribers.iter().cloned());
                }
            }
        }
        clients
    }

    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.filters.read().keys().cloned().collect();
        filters.sort();
        filters
    }

    pub fn subscribers(&self, filter: &str) -> Vec<Arc<str>> {
        let mut clients: Vec<Arc<str>> = self
            .filters
            .read()
            .get(filter)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        clients.sort();
        clients
    }
}

pub struct TopicRegistry {
    subscriptions: Arc<Subscriptions>,
    retained: RwLock<AHashMap<String, Bytes>>,
    qos2: RwLock<AHashSet<(Arc<str>, u16)>>,
    wills: RwLock<AHashMap<Arc<str>, AHashMap<u64, Will>>>,
    connections: Arc<ConnectionRegistry>,
    fanout: FanoutPool,
}

impl TopicRegistry {
    /// Must be called from within a Tokio runtime; spawns the fan-out pool.
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        fanout_pool_size: usize,
        fanout_queue_capacity: usize,
    ) -> Self {
        let subscriptions = Arc::new(Subscriptions::default());
        let fanout = FanoutPool::spawn(
            fanout_pool_size,
            fanout_queue_capacity,
            subscriptions.clone(),
            connections.clone(),
        );
        Self {
            subscriptions,
            retained: RwLock::new(AHashMap::new()),
            qos2: RwLock::new(AHashSet::new()),
            wills: RwLock::new(AHashMap::new()),
            connections,
            fanout,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    // Subscriptions

    /// Subscribe `client_id` to `filter`. Idempotent; returns true if the
    /// subscription is new.
    ///
    /// Follow with [`push_retained`](Self::push_retained) to replay the
    /// retained message. Retained messages are looked up by exact topic
    /// only: a wildcard filter such as `a/+` never receives the retained
    /// message of `a/b`.
    pub fn subscribe(&self, filter: &str, client_id: &Arc<str>) -> bool {
        let added = self.subscriptions.insert(filter, client_id);
        if added {
            debug!("{} subscribed to {}", client_id, filter);
        }
        added
    }

    /// Send the retained message whose topic equals `filter` to `client_id`.
    /// Returns whether one was queued.
    pub async fn push_retained(&self, filter: &str, client_id: &str) -> bool {
        let Some(payload) = self.retained(filter) else {
            return false;
        };
        let Some(conn) = self.connections.get(client_id) else {
            return false;
        };
        let packet = Packet::Publish(Publish::new(filter, payload).with_retain(true));
        match PacketEncoder::new(conn.protocol_version()).to_bytes(&packet) {
            Ok(bytes) => match conn.send(bytes).await {
                Ok(()) => true,
                Err(_) => {
                    trace!("{} closed before retained delivery", client_id);
                    false
                }
            },
            Err(e) => {
                debug!("cannot encode retained message for {}: {}", filter, e);
                false
            }
        }
    }

    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let removed = self.subscriptions.remove(filter, client_id);
        if removed {
            debug!("{} unsubscribed from {}", client_id, filter);
        }
        removed
    }

    pub fn unsubscribe_all(&self, client_id: &str) {
        self.subscriptions.remove_client(client_id);
    }

    /// Filters with at least one subscriber, sorted
    pub fn topics(&self) -> Vec<String> {
        self.subscriptions.filters()
    }

    pub fn subscribers(&self, filter: &str) -> Vec<Arc<str>> {
        self.subscriptions.subscribers(filter)
    }

    pub fn matching_clients(&self, topic: &str) -> AHashSet<Arc<str>> {
        self.subscriptions.matching(topic)
    }

    // Fan-out

    /// Queue `publish` for every matching subscriber; waits while the
    /// topic's fan-out shard is full.
    pub async fn publish_fanout(&self, publish: Publish) {
        self.fanout.submit(publish).await;
    }

    /// Deliver on the calling task, bypassing the pool
    pub async fn deliver_now(&self, publish: &Publish) -> usize {
        fanout::deliver(publish, &self.subscriptions, &self.connections).await
    }

    // Retained messages

    /// Store `payload` as the retained message of `topic`; an empty payload
    /// clears it.
    pub fn set_retained(&self, topic: &str, payload: Bytes) {
        let mut retained = self.retained.write();
        if payload.is_empty() {
            if retained.remove(topic).is_some() {
                debug!("cleared retained message on {}", topic);
            }
        } else {
            retained.insert(topic.to_string(), payload);
        }
    }

    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.retained.read().get(topic).cloned()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.read().len()
    }

    // QoS 2 identifiers

    /// Record `packet_id` as received from `client_id`. Returns false when
    /// the identifier is already awaiting PUBREL.
    pub fn set_qos2_id(&self, client_id: &Arc<str>, packet_id: u16) -> bool {
        self.qos2.write().insert((client_id.clone(), packet_id))
    }

    pub fn has_qos2_id(&self, client_id: &Arc<str>, packet_id: u16) -> bool {
        self.qos2.read().contains(&(client_id.clone(), packet_id))
    }

    pub fn remove_qos2_id(&self, client_id: &Arc<str>, packet_id: u16) -> bool {
        self.qos2.write().remove(&(client_id.clone(), packet_id))
    }

    /// Forget every identifier `client_id` left unreleased
    pub fn release_qos2_ids(&self, client_id: &str) -> usize {
        let mut qos2 = self.qos2.write();
        let before = qos2.len();
        qos2.retain(|(owner, _)| owner.as_ref() != client_id);
        before - qos2.len()
    }

    // Wills

    /// Register the will of connection `conn_id`. Wills are kept per
    /// connection, so a takeover does not replace the will of the
    /// connection it stops.
    pub fn set_will(&self, client_id: &Arc<str>, conn_id: u64, will: Will) {
        self.wills
            .write()
            .entry(client_id.clone())
            .or_default()
            .insert(conn_id, will);
    }

    pub fn will(&self, client_id: &str, conn_id: u64) -> Option<Will> {
        self.wills
            .read()
            .get(client_id)
            .and_then(|wills| wills.get(&conn_id))
            .cloned()
    }

    /// Drop the will registered by `conn_id`
    pub fn remove_will(&self, client_id: &str, conn_id: u64) -> Option<Will> {
        let mut wills = self.wills.write();
        let per_conn = wills.get_mut(client_id)?;
        let will = per_conn.remove(&conn_id);
        if per_conn.is_empty() {
            wills.remove(client_id);
        }
        will
    }

    /// Publish the will registered by `conn_id` to the will topic's
    /// subscribers and remove it. A retained will also replaces the
    /// topic's retained message. Returns whether a will was sent.
    pub async fn send_client_will(&self, client_id: &str, conn_id: u64) -> bool {
        let Some(will) = self.remove_will(client_id, conn_id) else {
            return false;
        };

        if will.retain {
            self.set_retained(&will.topic, will.payload.clone());
        }
        debug!("publishing will of {} to {}", client_id, will.topic);
        self.publish_fanout(Publish::new(will.topic.as_str(), will.payload))
            .await;
        true
    }
}
