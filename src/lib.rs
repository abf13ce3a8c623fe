//! TideMQ - lightweight MQTT v3.1.1/v5.0 broker core
//!
//! Packets are decoded per connection, dispatched to pluggable per packet
//! type handlers on a worker pool keyed by client id, and publishes are
//! fanned out to wildcard-matched subscribers on a second pool keyed by
//! topic.

pub mod admin;
pub mod broker;
pub mod codec;
pub mod config;
pub mod handler;
pub mod hooks;
pub mod protocol;
pub mod topic;

pub use admin::{AdminApi, AdminServer};
pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use handler::{Handler, HandlerRegistry};
pub use hooks::ConnectVerifier;
pub use protocol::{ProtocolVersion, QoS};
pub use topic::TopicRegistry;
