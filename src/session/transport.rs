use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{trace, warn};

use super::messages::{Envelope, PeerMessage};
use crate::ledger::types::PeerId;

const LOG_TARGET: &str = "legit_mahjong::session::transport";
const INBOX_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no route to peer {0}")]
    UnknownPeer(PeerId),

    #[error("peer {0} is already connected")]
    AlreadyJoined(PeerId),

    #[error("transport closed")]
    Closed,
}

/// Delivery of peer messages. Ordering is preserved per sender.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_peer(&self) -> &str;

    async fn send_to(&self, peer: &str, message: PeerMessage) -> Result<(), TransportError>;

    /// Sends to every other connected peer.
    async fn broadcast(&self, message: PeerMessage) -> Result<(), TransportError>;

    async fn recv(&self) -> Result<Envelope, TransportError>;

    /// Next queued envelope without waiting, if any.
    fn try_recv(&self) -> Result<Option<Envelope>, TransportError>;
}

/// Process-local switchboard connecting peers through tokio channels.
#[derive(Default)]
pub struct InMemoryHub {
    routes: DashMap<PeerId, mpsc::Sender<Envelope>>,
}

impl InMemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(
        self: &Arc<Self>,
        peer_id: impl Into<PeerId>,
    ) -> Result<InMemoryTransport, TransportError> {
        let peer_id = peer_id.into();
        if self.routes.contains_key(&peer_id) {
            return Err(TransportError::AlreadyJoined(peer_id));
        }
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.routes.insert(peer_id.clone(), tx);
        Ok(InMemoryTransport {
            peer_id,
            hub: Arc::clone(self),
            inbox: TokioMutex::new(rx),
        })
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.routes.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    fn route(&self, peer: &str) -> Option<mpsc::Sender<Envelope>> {
        self.routes.get(peer).map(|entry| entry.value().clone())
    }

    fn leave(&self, peer: &str) {
        self.routes.remove(peer);
    }
}

pub struct InMemoryTransport {
    peer_id: PeerId,
    hub: Arc<InMemoryHub>,
    inbox: TokioMutex<mpsc::Receiver<Envelope>>,
}

impl InMemoryTransport {
    async fn deliver(&self, to: &str, message: PeerMessage) -> Result<(), TransportError> {
        let route = self
            .hub
            .route(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.to_string()))?;
        trace!(target: LOG_TARGET, from = %self.peer_id, to, kind = message.kind(), "delivering");
        route
            .send(Envelope {
                from: self.peer_id.clone(),
                message,
            })
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl PeerTransport for InMemoryTransport {
    fn local_peer(&self) -> &str {
        &self.peer_id
    }

    async fn send_to(&self, peer: &str, message: PeerMessage) -> Result<(), TransportError> {
        self.deliver(peer, message).await
    }

    async fn broadcast(&self, message: PeerMessage) -> Result<(), TransportError> {
        for peer in self.hub.peers() {
            if peer == self.peer_id {
                continue;
            }
            if let Err(err) = self.deliver(&peer, message.clone()).await {
                warn!(target: LOG_TARGET, from = %self.peer_id, to = %peer, error = %err, "broadcast delivery failed");
                return Err(err);
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Envelope, TransportError> {
        self.inbox.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    fn try_recv(&self) -> Result<Option<Envelope>, TransportError> {
        let Ok(mut inbox) = self.inbox.try_lock() else {
            return Ok(None);
        };
        match inbox.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        self.hub.leave(&self.peer_id);
    }
}
