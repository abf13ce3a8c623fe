//! Request dispatch
//!
//! With pooling enabled, requests go to one of a fixed set of workers
//! chosen by an FNV hash of the client id, so all packets of one client run
//! in arrival order. Each worker has a bounded queue and `dispatch` waits
//! while it is full, stalling the inbound loop of every client hashed to
//! that worker. With pooling disabled every request runs on its own task
//! and a client's packets may be handled out of order.

use std::hash::Hasher;
use std::sync::Arc;

use fnv::FnvHasher;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::HandlerRegistry;
use crate::broker::{ConnectionError, Request};
use crate::topic::TopicRegistry;

enum Job {
    Run(Request),
    /// Completes once every job queued before it on the shard has run
    Barrier(oneshot::Sender<()>),
}

pub struct Dispatcher {
    handlers: Arc<HandlerRegistry>,
    topics: Arc<TopicRegistry>,
    shards: Vec<mpsc::Sender<Job>>,
}

impl Dispatcher {
    /// Pooled dispatcher with `size` workers; must be called from within a
    /// Tokio runtime.
    pub fn pooled(
        size: usize,
        capacity: usize,
        handlers: Arc<HandlerRegistry>,
        topics: Arc<TopicRegistry>,
    ) -> Self {
        let shards = (0..size.max(1))
            .map(|worker| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                tokio::spawn(run_worker(worker, rx, handlers.clone(), topics.clone()));
                tx
            })
            .collect();
        Self {
            handlers,
            topics,
            shards,
        }
    }

    /// Dispatcher that spawns one task per request
    pub fn unpooled(handlers: Arc<HandlerRegistry>, topics: Arc<TopicRegistry>) -> Self {
        Self {
            handlers,
            topics,
            shards: Vec::new(),
        }
    }

    pub fn is_pooled(&self) -> bool {
        !self.shards.is_empty()
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Worker index serving `client_id`
    pub fn shard_of(&self, client_id: &str) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(client_id.as_bytes());
        (hasher.finish() % self.shards.len().max(1) as u64) as usize
    }

    pub async fn dispatch(&self, req: Request) {
        if !self.is_pooled() {
            let handlers = self.handlers.clone();
            let topics = self.topics.clone();
            tokio::spawn(async move { process(&handlers, &topics, req).await });
            return;
        }

        let shard = self.shard_of(req.client_id());
        if self.shards[shard].send(Job::Run(req)).await.is_err() {
            warn!("request worker {} is gone, request dropped", shard);
        }
    }

    /// Wait until every request already queued for `client_id` has been
    /// handled. Returns immediately when pooling is disabled.
    pub async fn flush(&self, client_id: &str) {
        if !self.is_pooled() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        let shard = self.shard_of(client_id);
        if self.shards[shard].send(Job::Barrier(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_worker(
    worker: usize,
    mut rx: mpsc::Receiver<Job>,
    handlers: Arc<HandlerRegistry>,
    topics: Arc<TopicRegistry>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Run(req) => process(&handlers, &topics, req).await,
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("request worker {} stopped", worker);
}

/// Run one request through pre_handle, handle and post_handle
pub async fn process(handlers: &HandlerRegistry, topics: &TopicRegistry, req: Request) {
    let packet_type = req.packet_type();
    let Some(handler) = handlers.get(packet_type) else {
        warn!(
            "no handler for {:?} from {}, dropped",
            packet_type,
            req.client_id()
        );
        return;
    };

    let result: Result<(), ConnectionError> = async {
        handler.pre_handle(&req, topics).await?;
        handler.handle(&req, topics).await?;
        handler.post_handle(&req, topics).await
    }
    .await;

    match result {
        Ok(()) => {}
        Err(ConnectionError::Closed) => {
            debug!("{} closed while handling {:?}", req.client_id(), packet_type);
        }
        Err(e) => {
            warn!(
                "terminating {} after {:?}: {}",
                req.client_id(),
                packet_type,
                e
            );
            req.terminate();
        }
    }
}
