//! Local and remote peer handles.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::address::Multiaddr;
use crate::channel::Channel;
use crate::context::{ContextId, PeerContext};
use crate::error::{PeerError, PeerResult};
use crate::factory::PeerFactory;
use crate::identity::{Identity, PeerId, PublicKey};
use crate::listener::Listener;

/// This process's side of the network: an identity plus the factory it dials
/// and listens through. Cheap to clone; clones refer to the same peer.
#[derive(Clone)]
pub struct LocalPeer {
    inner: Arc<LocalPeerInner>,
}

struct LocalPeerInner {
    factory: PeerFactory,
    identity: Identity,
    address: RwLock<Multiaddr>,
}

impl LocalPeer {
    pub(crate) fn new(factory: PeerFactory, identity: Identity, address: Multiaddr) -> Self {
        Self {
            inner: Arc::new(LocalPeerInner {
                factory,
                identity,
                address: RwLock::new(address),
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.identity.peer_id()
    }

    /// Current address; updated to the bound address by `listen`.
    pub fn address(&self) -> Multiaddr {
        self.inner.address.read().clone()
    }

    pub(crate) fn set_address(&self, address: Multiaddr) {
        *self.inner.address.write() = address;
    }

    pub fn factory(&self) -> &PeerFactory {
        &self.inner.factory
    }

    /// Whether both handles refer to the same local peer.
    pub fn same_peer(&self, other: &LocalPeer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Connect to `address` and return the negotiated remote peer.
    pub async fn dial(&self, address: &Multiaddr, token: &CancellationToken) -> PeerResult<RemotePeer> {
        self.inner.factory.dial(self, address, token).await
    }

    /// Accept connections on `address` until the listener or `token` closes.
    pub async fn listen(&self, address: &Multiaddr, token: &CancellationToken) -> PeerResult<Listener> {
        self.inner.factory.listen(self, address, token).await
    }
}

impl fmt::Debug for LocalPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPeer")
            .field("peer_id", &self.peer_id())
            .field("address", &self.address())
            .finish()
    }
}

/// A negotiated connection to another peer.
///
/// Holds only a weak reference to its context: once the connection is gone,
/// sub-protocol dials fail with `ConnectionClosed`.
pub struct RemotePeer {
    local_peer: LocalPeer,
    context: Weak<PeerContext>,
    context_id: ContextId,
    channel: Channel,
    address: Multiaddr,
    public_key: PublicKey,
}

impl RemotePeer {
    pub(crate) fn new(context: &Arc<PeerContext>, address: Multiaddr, public_key: PublicKey) -> Self {
        Self {
            local_peer: context.local_peer().clone(),
            context: Arc::downgrade(context),
            context_id: context.id(),
            channel: context.channel().clone(),
            address,
            public_key,
        }
    }

    /// Independent handle onto the same connection. Shares the local peer,
    /// context and channel; the address is copied.
    pub fn fork(&self) -> RemotePeer {
        RemotePeer {
            local_peer: self.local_peer.clone(),
            context: self.context.clone(),
            context_id: self.context_id,
            channel: self.channel.clone(),
            address: self.address.clone(),
            public_key: self.public_key,
        }
    }

    /// Address carrying the remote peer id.
    pub fn address(&self) -> &Multiaddr {
        &self.address
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn local_peer(&self) -> &LocalPeer {
        &self.local_peer
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn context(&self) -> Option<Arc<PeerContext>> {
        self.context.upgrade()
    }

    /// Open `protocol_id` over this connection and run its dialer side.
    /// Completes when that session ends.
    pub async fn dial(&self, protocol_id: &str, token: &CancellationToken) -> PeerResult<()> {
        let context = self.context.upgrade().ok_or(PeerError::ConnectionClosed)?;
        self.local_peer
            .factory()
            .dial_sub_protocol(&context, protocol_id, token)
            .await
    }

    /// Close the connection. Every session sharing it observes the close.
    pub fn disconnect(&self) {
        self.channel.close();
    }

    pub fn is_connected(&self) -> bool {
        !self.channel.is_closed()
    }

    /// Resolves once the connection is closed, from either side.
    pub async fn closed(&self) {
        self.channel.closed().await
    }
}

impl Clone for RemotePeer {
    fn clone(&self) -> Self {
        self.fork()
    }
}

impl fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePeer")
            .field("ctx", &self.context_id)
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}
