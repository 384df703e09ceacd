//! Per-connection negotiation state shared between the caller and the outer protocol.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::address::Multiaddr;
use crate::channel::Channel;
use crate::error::{PeerError, PeerResult};
use crate::identity::{PeerId, PublicKey};
use crate::peer::{LocalPeer, RemotePeer};

/// Diagnostic id of a context, unique per factory.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContextId(pub(crate) u64);

impl ContextId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Request to open a sub-protocol over an established connection.
/// Resolved exactly once; dropping it unresolved reports `ConnectionClosed`
/// to the waiting caller.
pub struct ChannelRequest {
    protocol_id: String,
    token: CancellationToken,
    completion: oneshot::Sender<PeerResult<()>>,
}

impl ChannelRequest {
    pub fn new(
        protocol_id: impl Into<String>,
        token: CancellationToken,
    ) -> (Self, oneshot::Receiver<PeerResult<()>>) {
        let (completion, rx) = oneshot::channel();
        let request = Self {
            protocol_id: protocol_id.into(),
            token,
            completion,
        };
        (request, rx)
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The caller stopped waiting or cancelled.
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed() || self.token.is_cancelled()
    }

    pub fn resolve(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, error: PeerError) {
        self.complete(Err(error));
    }

    pub fn complete(self, result: PeerResult<()>) {
        let _ = self.completion.send(result);
    }
}

impl fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("protocol_id", &self.protocol_id)
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

/// Single-consumer side of a context's pending requests.
/// Dropping the queue fails everything still in it.
pub struct RequestQueue {
    rx: mpsc::UnboundedReceiver<ChannelRequest>,
}

impl RequestQueue {
    /// Next request whose caller is still waiting. Abandoned requests are
    /// failed with `Cancelled` and skipped.
    pub async fn next(&mut self) -> Option<ChannelRequest> {
        while let Some(request) = self.rx.recv().await {
            if request.is_abandoned() {
                debug!(protocol = request.protocol_id(), "skipping abandoned request");
                request.fail(PeerError::Cancelled);
                continue;
            }
            return Some(request);
        }
        None
    }

    /// Stop accepting requests and fail every queued one with `ConnectionClosed`.
    pub fn fail_all(&mut self) {
        self.rx.close();
        while let Ok(request) = self.rx.try_recv() {
            request.fail(PeerError::ConnectionClosed);
        }
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.fail_all();
    }
}

/// How a context reports that its connection became usable. Each context
/// signals only its own waiter.
enum Readiness {
    Dial {
        ready: Mutex<Option<oneshot::Sender<PeerResult<RemotePeer>>>>,
    },
    Listen {
        /// Requested bind address, annotated with the local peer id.
        address: Multiaddr,
        bound: Mutex<Option<oneshot::Sender<PeerResult<Multiaddr>>>>,
        arrivals: mpsc::UnboundedSender<RemotePeer>,
    },
    Inbound {
        arrivals: mpsc::UnboundedSender<RemotePeer>,
    },
}

/// State of one logical connection (or of one listening endpoint).
pub struct PeerContext {
    id: ContextId,
    local_peer: LocalPeer,
    channel: Channel,
    remote_address: RwLock<Option<Multiaddr>>,
    remote_key: OnceLock<PublicKey>,
    requests_tx: mpsc::UnboundedSender<ChannelRequest>,
    requests_rx: Mutex<Option<RequestQueue>>,
    readiness: Readiness,
}

pub(crate) type DialReady = oneshot::Receiver<PeerResult<RemotePeer>>;
pub(crate) type ListenReady = (
    oneshot::Receiver<PeerResult<Multiaddr>>,
    mpsc::UnboundedReceiver<RemotePeer>,
);

impl PeerContext {
    fn new(
        id: ContextId,
        local_peer: LocalPeer,
        channel: Channel,
        remote_address: Option<Multiaddr>,
        readiness: Readiness,
    ) -> Arc<Self> {
        let (requests_tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            local_peer,
            channel,
            remote_address: RwLock::new(remote_address),
            remote_key: OnceLock::new(),
            requests_tx,
            requests_rx: Mutex::new(Some(RequestQueue { rx })),
            readiness,
        })
    }

    /// Context for an outbound connection to `address`.
    pub(crate) fn for_dialer(
        id: ContextId,
        local_peer: LocalPeer,
        channel: Channel,
        address: Multiaddr,
    ) -> (Arc<Self>, DialReady) {
        let (tx, rx) = oneshot::channel();
        let readiness = Readiness::Dial {
            ready: Mutex::new(Some(tx)),
        };
        let ctx = Self::new(id, local_peer, channel, Some(address), readiness);
        (ctx, rx)
    }

    /// Context for a listening endpoint on `address`. Accepted connections
    /// are forked from it.
    pub(crate) fn for_listener(
        id: ContextId,
        local_peer: LocalPeer,
        channel: Channel,
        address: Multiaddr,
    ) -> (Arc<Self>, ListenReady) {
        let (bound_tx, bound_rx) = oneshot::channel();
        let (arrivals, arrivals_rx) = mpsc::unbounded_channel();
        let readiness = Readiness::Listen {
            address,
            bound: Mutex::new(Some(bound_tx)),
            arrivals,
        };
        let ctx = Self::new(id, local_peer, channel, None, readiness);
        (ctx, (bound_rx, arrivals_rx))
    }

    /// New context for a connection accepted by this listener. `channel` is the
    /// handle remote peers on that connection disconnect through.
    pub fn fork_inbound(
        self: &Arc<Self>,
        channel: Channel,
        remote_address: Multiaddr,
    ) -> PeerResult<Arc<PeerContext>> {
        let arrivals = match &self.readiness {
            Readiness::Listen { arrivals, .. } | Readiness::Inbound { arrivals } => arrivals.clone(),
            Readiness::Dial { .. } => {
                return Err(PeerError::ProtocolViolation(
                    "inbound connection on a dialing context".into(),
                ))
            }
        };
        let id = self.local_peer.factory().next_context_id();
        debug!(ctx = %id, parent = %self.id, addr = %remote_address, "inbound connection");
        Ok(Self::new(
            id,
            self.local_peer.clone(),
            channel,
            Some(remote_address),
            Readiness::Inbound { arrivals },
        ))
    }

    /// Record the negotiated remote peer and signal readiness to this
    /// context's waiter. `address` is annotated with the remote peer id; an
    /// existing, different peer id is a protocol violation.
    pub fn connected(self: &Arc<Self>, address: &Multiaddr, public_key: PublicKey) -> PeerResult<()> {
        let peer_id = PeerId::from_public_key(&public_key);
        let address = address.with_peer_id(peer_id);
        if address.peer_id() != Some(peer_id) {
            return Err(PeerError::ProtocolViolation(format!(
                "address {} does not belong to peer {}",
                address, peer_id
            )));
        }
        if let Readiness::Listen { .. } = self.readiness {
            return Err(PeerError::ProtocolViolation(
                "listening context cannot be connected".into(),
            ));
        }
        self.remote_key
            .set(public_key)
            .map_err(|_| PeerError::AlreadyConfigured("remote peer"))?;
        *self.remote_address.write() = Some(address.clone());

        let remote = RemotePeer::new(self, address, public_key);
        info!(ctx = %self.id, peer = %peer_id.short(), addr = %remote.address(), "connected");
        match &self.readiness {
            Readiness::Dial { ready } => {
                if let Some(tx) = ready.lock().take() {
                    let _ = tx.send(Ok(remote));
                }
            }
            Readiness::Inbound { arrivals } | Readiness::Listen { arrivals, .. } => {
                let _ = arrivals.send(remote);
            }
        }
        Ok(())
    }

    /// Report the bound address of a listening context. Set once.
    pub fn listener_ready(&self, bound: Multiaddr) -> PeerResult<()> {
        match &self.readiness {
            Readiness::Listen { bound: slot, .. } => {
                let tx = slot
                    .lock()
                    .take()
                    .ok_or(PeerError::AlreadyConfigured("listener address"))?;
                let _ = tx.send(Ok(bound));
                Ok(())
            }
            _ => Err(PeerError::ProtocolViolation(
                "listener_ready on a connection context".into(),
            )),
        }
    }

    /// Fail whatever is still waiting on this context: the readiness signal
    /// with `error`, queued requests with `ConnectionClosed`.
    pub fn fail_pending(&self, error: PeerError) {
        match &self.readiness {
            Readiness::Dial { ready } => {
                if let Some(tx) = ready.lock().take() {
                    let _ = tx.send(Err(error));
                }
            }
            Readiness::Listen { bound, .. } => {
                if let Some(tx) = bound.lock().take() {
                    let _ = tx.send(Err(error));
                }
            }
            Readiness::Inbound { .. } => {}
        }
        if let Some(mut queue) = self.requests_rx.lock().take() {
            queue.fail_all();
        }
    }

    /// Queue a sub-protocol request for the outer protocol. If the queue is
    /// gone the request fails with `ConnectionClosed`.
    pub fn enqueue(&self, request: ChannelRequest) {
        if let Err(mpsc::error::SendError(request)) = self.requests_tx.send(request) {
            request.fail(PeerError::ConnectionClosed);
        }
    }

    /// Take the consumer side of the request queue. Only the first call gets it.
    pub fn take_requests(&self) -> Option<RequestQueue> {
        self.requests_rx.lock().take()
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn local_peer(&self) -> &LocalPeer {
        &self.local_peer
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_dialer(&self) -> bool {
        matches!(self.readiness, Readiness::Dial { .. })
    }

    /// Address a listening context was asked to bind. `None` for connections.
    pub fn listen_address(&self) -> Option<&Multiaddr> {
        match &self.readiness {
            Readiness::Listen { address, .. } => Some(address),
            _ => None,
        }
    }

    /// Target address while dialing, negotiated address once connected.
    pub fn remote_address(&self) -> Option<Multiaddr> {
        self.remote_address.read().clone()
    }

    pub fn remote_public_key(&self) -> Option<PublicKey> {
        self.remote_key.get().copied()
    }

    pub fn remote_peer_id(&self) -> Option<PeerId> {
        self.remote_key.get().map(PeerId::from_public_key)
    }
}

impl fmt::Debug for PeerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerContext")
            .field("id", &self.id)
            .field("local", &self.local_peer.peer_id())
            .field("remote", &self.remote_address())
            .finish_non_exhaustive()
    }
}
