//! Known peers by listener address. Additions are reported so the node can dial them.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;
use peerlink_core::{LocalPeer, Multiaddr, PeerError, PeerId, PeerResult};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AddOutcome {
    Added,
    /// The address is our own listener.
    SelfAddress,
    /// A peer with the same id is already known.
    Duplicate,
    MissingPeerId,
}

pub struct RoutingTable {
    local_peer: OnceLock<LocalPeer>,
    local_listener: OnceLock<Multiaddr>,
    peers: RwLock<HashMap<PeerId, Multiaddr>>,
    added: mpsc::UnboundedSender<Multiaddr>,
}

impl RoutingTable {
    /// New table plus the stream of newly added listener addresses.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Multiaddr>) {
        let (added, rx) = mpsc::unbounded_channel();
        let table = Self {
            local_peer: OnceLock::new(),
            local_listener: OnceLock::new(),
            peers: RwLock::new(HashMap::new()),
            added,
        };
        (table, rx)
    }

    pub fn set_local_peer(&self, peer: LocalPeer) -> PeerResult<()> {
        self.local_peer
            .set(peer)
            .map_err(|_| PeerError::AlreadyConfigured("local peer"))
    }

    pub fn local_peer(&self) -> PeerResult<&LocalPeer> {
        self.local_peer
            .get()
            .ok_or(PeerError::NotConfigured("local peer"))
    }

    pub fn set_local_listener_address(&self, address: Multiaddr) -> PeerResult<()> {
        self.local_listener
            .set(address)
            .map_err(|_| PeerError::AlreadyConfigured("local listener address"))
    }

    pub fn local_listener_address(&self) -> PeerResult<&Multiaddr> {
        self.local_listener
            .get()
            .ok_or(PeerError::NotConfigured("local listener address"))
    }

    fn is_local(&self, id: PeerId) -> bool {
        self.local_peer.get().map(LocalPeer::peer_id) == Some(id)
            || self.local_listener.get().and_then(Multiaddr::peer_id) == Some(id)
    }

    pub fn add(&self, address: Multiaddr) -> AddOutcome {
        let Some(id) = address.peer_id() else {
            debug!(addr = %address, "address without peer id ignored");
            return AddOutcome::MissingPeerId;
        };
        if self.is_local(id) {
            return AddOutcome::SelfAddress;
        }
        {
            let mut peers = self.peers.write();
            if peers.contains_key(&id) {
                return AddOutcome::Duplicate;
            }
            peers.insert(id, address.clone());
        }
        info!(peer = %id.short(), addr = %address, "peer added");
        let _ = self.added.send(address);
        AddOutcome::Added
    }

    /// Remove the peer `address` belongs to. Returns whether it was known.
    pub fn remove(&self, address: &Multiaddr) -> bool {
        let Some(id) = address.peer_id() else {
            return false;
        };
        let removed = self.peers.write().remove(&id).is_some();
        if removed {
            info!(peer = %id.short(), addr = %address, "peer removed");
        }
        removed
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn peers(&self) -> Vec<Multiaddr> {
        self.peers.read().values().cloned().collect()
    }
}
