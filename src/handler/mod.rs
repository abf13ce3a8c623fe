//! Packet handlers
//!
//! Every inbound packet of a bound connection is wrapped in a [`Request`]
//! and run through the handler registered for its packet type:
//! `pre_handle`, then `handle`, then `post_handle`. An error from any stage
//! skips the rest and terminates the connection. A packet type with no
//! handler is logged and dropped.
//!
//! [`HandlerRegistry::with_defaults`] maps every packet type except AUTH to
//! [`DefaultHandler`]; applications replace entries to customize behavior.

mod defaults;
mod dispatch;


pub use defaults::DefaultHandler;
pub use dispatch::Dispatcher;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::broker::{ConnectionError, Request};
use crate::protocol::PacketType;
use crate::topic::TopicRegistry;

/// Per packet type behavior, run in three stages
#[async_trait]
pub trait Handler: Send + Sync {
    async fn pre_handle(&self, req: &Request, topics: &TopicRegistry) -> Result<(), ConnectionError>;

    async fn handle(&self, req: &Request, topics: &TopicRegistry) -> Result<(), ConnectionError>;

    async fn post_handle(&self, req: &Request, topics: &TopicRegistry) -> Result<(), ConnectionError>;
}

/// Packet type -> handler map
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<PacketType, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    /// Registry with no handlers; every packet is dropped
    pub fn empty() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        let default: Arc<dyn Handler> = Arc::new(DefaultHandler);
        let handlers = PacketType::ALL
            .iter()
            .filter(|t| **t != PacketType::Auth)
            .map(|t| (*t, default.clone()))
            .collect();
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Install `handler` for `packet_type`, returning the one it replaced
    pub fn register(
        &self,
        packet_type: PacketType,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        self.handlers.write().insert(packet_type, handler)
    }

    pub fn remove(&self, packet_type: PacketType) -> Option<Arc<dyn Handler>> {
        self.handlers.write().remove(&packet_type)
    }

    pub fn get(&self, packet_type: PacketType) -> Option<Arc<dyn Handler>> {
        self.handlers.read().get(&packet_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
