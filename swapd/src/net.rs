//! Interfaces to the peer-to-peer layer. The daemon consumes the network
//! through these traits; transport, discovery and framing live outside this
//! crate. A loopback implementation is provided for development and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::message::Envelope;

/// Opaque peer identifier supplied by the network layer.
pub type PeerId = String;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("peer gone")]
    PeerGone,
    #[error("network error: {0}")]
    Other(String),
}

/// Outbound message delivery.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, peer: &PeerId, envelope: Envelope) -> Result<(), NetError>;
}

/// Inbound message sink registered by the daemon.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, peer: PeerId, envelope: Envelope);
}

/// Lifecycle of the network host.
#[async_trait]
pub trait Host: Send + Sync {
    fn set_handler(&self, handler: Arc<dyn InboundHandler>);
    async fn start(&self) -> Result<(), NetError>;
    async fn stop(&self) -> Result<(), NetError>;
    fn local_peer(&self) -> PeerId;
}

/// In-process message bus connecting hosts by peer id. Stands in for a real
/// transport in development runs and integration tests.
#[derive(Default)]
pub struct LoopbackBus {
    handlers: Mutex<HashMap<PeerId, Arc<dyn InboundHandler>>>,
}

impl LoopbackBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn host(self: &Arc<Self>, peer: PeerId) -> Arc<LoopbackHost> {
        Arc::new(LoopbackHost {
            bus: self.clone(),
            peer,
            handler: Mutex::new(None),
        })
    }
}

pub struct LoopbackHost {
    bus: Arc<LoopbackBus>,
    peer: PeerId,
    handler: Mutex<Option<Arc<dyn InboundHandler>>>,
}

#[async_trait]
impl Host for LoopbackHost {
    fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    async fn start(&self) -> Result<(), NetError> {
        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| NetError::Other("no handler registered".into()))?;
        self.bus
            .handlers
            .lock()
            .unwrap()
            .insert(self.peer.clone(), handler);
        debug!(peer = %self.peer, "Loopback host started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), NetError> {
        self.bus.handlers.lock().unwrap().remove(&self.peer);
        Ok(())
    }

    fn local_peer(&self) -> PeerId {
        self.peer.clone()
    }
}

#[async_trait]
impl MessageSender for LoopbackHost {
    async fn send(&self, peer: &PeerId, envelope: Envelope) -> Result<(), NetError> {
        let handler = self
            .bus
            .handlers
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .ok_or(NetError::PeerGone)?;
        let from = self.peer.clone();
        handler.handle(from, envelope).await;
        Ok(())
    }
}
