//! MQTT Broker Core
//!
//! [`Broker`] owns the registries and worker pools, accepts transports and
//! exposes the operations the admin layer builds on.

mod connection;
mod registry;
mod request;

pub use connection::{Connection, ConnectionError, SendError};
pub use registry::ConnectionRegistry;
pub use request::Request;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::handler::{Dispatcher, Handler, HandlerRegistry};
use crate::hooks::{AllowAll, ConnectVerifier};
use crate::protocol::{PacketType, Publish, QoS};
use crate::topic::TopicRegistry;

/// Size and queue depth of a worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub enabled: bool,
    pub size: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: 10,
            queue_capacity: 1024,
        }
    }
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Name reported by server info
    pub name: String,
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Bound connections; further CONNECTs are refused
    pub max_connections: usize,
    /// Largest remaining length accepted from a client
    pub max_packet_size: usize,
    /// Frames buffered per connection before writers wait
    pub outbound_queue_capacity: usize,
    /// Idle time after which a connection is closed
    pub keep_alive: Duration,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    /// Request dispatch pool
    pub workers: PoolConfig,
    /// Publish fan-out pool; always enabled
    pub fanout: PoolConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "tidemq".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 100,
            max_packet_size: 2048,
            outbound_queue_capacity: 1024,
            keep_alive: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            workers: PoolConfig::default(),
            fanout: PoolConfig::default(),
        }
    }
}

/// State shared by the accept loop and every connection task
pub(crate) struct Shared {
    pub(crate) config: BrokerConfig,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) topics: Arc<TopicRegistry>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) dispatcher: Dispatcher,
    verifier: RwLock<Arc<dyn ConnectVerifier>>,
    next_conn_id: AtomicU64,
    next_packet_id: AtomicU16,
}

impl Shared {
    pub(crate) fn verifier(&self) -> Arc<dyn ConnectVerifier> {
        self.verifier.read().clone()
    }
}

/// The MQTT Broker. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Broker {
    /// Create a broker with the default handlers and no connect checks.
    ///
    /// Must be called from within a Tokio runtime: the worker pools are
    /// started here.
    pub fn new(config: BrokerConfig) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let topics = Arc::new(TopicRegistry::new(
            connections.clone(),
            config.fanout.size,
            config.fanout.queue_capacity,
        ));
        let handlers = Arc::new(HandlerRegistry::with_defaults());
        let dispatcher = if config.workers.enabled {
            Dispatcher::pooled(
                config.workers.size,
                config.workers.queue_capacity,
                handlers.clone(),
                topics.clone(),
            )
        } else {
            Dispatcher::unpooled(handlers.clone(), topics.clone())
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                connections,
                topics,
                handlers,
                dispatcher,
                verifier: RwLock::new(Arc::new(AllowAll)),
                next_conn_id: AtomicU64::new(1),
                next_packet_id: AtomicU16::new(0),
            }),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    pub fn topics(&self) -> &Arc<TopicRegistry> {
        &self.shared.topics
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.connections
    }

    /// Replace the CONNECT verification hook
    pub fn set_connect_verifier(&self, verifier: Arc<dyn ConnectVerifier>) {
        *self.shared.verifier.write() = verifier;
    }

    /// Install `handler` for `packet_type`, replacing the current one
    pub fn register_handler(&self, packet_type: PacketType, handler: Arc<dyn Handler>) {
        self.shared.handlers.register(packet_type, handler);
    }

    /// Bind the configured address and serve until [`stop`](Self::stop)
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`stop`](Self::stop)
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("MQTT/TCP listening on {}", listener.local_addr()?);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(connection::serve(stream, addr, conn_id, self.shared.clone()));
                    }
                    Err(e) => error!("Failed to accept TCP connection: {}", e),
                },
            }
        }

        info!("MQTT/TCP listener stopped");
        Ok(())
    }

    /// Stop accepting and stop every bound connection. Stopped connections
    /// run their normal teardown, wills included.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        for conn in self.shared.connections.all() {
            conn.stop();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Bound client ids, sorted
    pub fn client_ids(&self) -> Vec<String> {
        self.shared.connections.client_ids()
    }

    /// Filters with at least one subscriber, sorted
    pub fn topic_list(&self) -> Vec<String> {
        self.shared.topics.topics()
    }

    /// Stop one bound connection; false if `client_id` is not connected
    pub fn stop_connection(&self, client_id: &str) -> bool {
        match self.shared.connections.get(client_id) {
            Some(conn) => {
                conn.stop();
                true
            }
            None => false,
        }
    }

    /// Broker-originated publish through the fan-out pool. QoS 1 and 2
    /// get a broker-allocated packet identifier. The retained table is not
    /// touched; use [`set_retained`](Self::set_retained).
    pub async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) {
        let packet_id = (qos != QoS::AtMostOnce).then(|| self.next_packet_id());
        let publish = Publish::new(topic, payload).with_qos(qos, packet_id);
        self.shared.topics.publish_fanout(publish).await;
    }

    /// Set the retained message of `topic`; an empty payload clears it
    pub fn set_retained(&self, topic: &str, payload: Bytes) {
        self.shared.topics.set_retained(topic, payload);
    }

    /// Next nonzero packet identifier, wrapping after 65535
    fn next_packet_id(&self) -> u16 {
        loop {
            let id = self
                .shared
                .next_packet_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}
