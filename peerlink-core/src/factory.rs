//! Peer factory: builds local peers and drives dial/listen through the outer protocol.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::{Multiaddr, Protocol as AddrComponent};
use crate::channel::Channel;
use crate::context::{ChannelRequest, ContextId, PeerContext};
use crate::error::{PeerError, PeerResult};
use crate::identity::Identity;
use crate::listener::Listener;
use crate::peer::{LocalPeer, RemotePeer};
use crate::protocol::{ChannelFactory, Protocol, ProtocolRegistry};

/// Runs once per negotiated connection, before `dial` returns or the
/// listener yields the peer. An error disconnects the peer.
#[async_trait]
pub trait ConnectionHook: Send + Sync {
    async fn connected_to(&self, remote: &RemotePeer, is_dialer: bool) -> PeerResult<()> {
        let _ = (remote, is_dialer);
        Ok(())
    }
}

/// Hook that does nothing.
pub struct NoopHook;

#[async_trait]
impl ConnectionHook for NoopHook {}

#[derive(Default)]
pub struct PeerFactoryBuilder {
    protocol: Option<Arc<dyn Protocol>>,
    registry: ProtocolRegistry,
    hook: Option<Arc<dyn ConnectionHook>>,
    error: Option<PeerError>,
}

impl PeerFactoryBuilder {
    /// Protocol invoked directly by `dial` and `listen`. Set once.
    pub fn outer_protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        if self.protocol.is_some() {
            self.error
                .get_or_insert(PeerError::AlreadyConfigured("outer protocol"));
        } else {
            self.protocol = Some(protocol);
        }
        self
    }

    /// Sub-protocol shared by every session.
    pub fn app_protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        if let Err(e) = self.registry.register_instance(protocol) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Sub-protocol built fresh for every session.
    pub fn app_protocol_with<F>(mut self, id: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Arc<dyn Protocol> + Send + Sync + 'static,
    {
        if let Err(e) = self.registry.register(id, constructor) {
            self.error.get_or_insert(e);
        }
        self
    }

    pub fn hook(mut self, hook: Arc<dyn ConnectionHook>) -> Self {
        if self.hook.is_some() {
            self.error
                .get_or_insert(PeerError::AlreadyConfigured("connection hook"));
        } else {
            self.hook = Some(hook);
        }
        self
    }

    pub fn build(self) -> PeerResult<PeerFactory> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let protocol = self
            .protocol
            .ok_or(PeerError::NotConfigured("outer protocol"))?;
        Ok(PeerFactory {
            inner: Arc::new(FactoryInner {
                protocol,
                upgrader: Arc::new(ChannelFactory::new(self.registry)),
                hook: self.hook.unwrap_or_else(|| Arc::new(NoopHook)),
                next_context_id: AtomicU64::new(0),
            }),
        })
    }
}

/// Immutable after `build()`. Cheap to clone.
#[derive(Clone)]
pub struct PeerFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    protocol: Arc<dyn Protocol>,
    upgrader: Arc<ChannelFactory>,
    hook: Arc<dyn ConnectionHook>,
    next_context_id: AtomicU64,
}

impl PeerFactory {
    pub fn builder() -> PeerFactoryBuilder {
        PeerFactoryBuilder::default()
    }

    pub fn outer_protocol_id(&self) -> &str {
        self.inner.protocol.id()
    }

    pub fn upgrader(&self) -> &Arc<ChannelFactory> {
        &self.inner.upgrader
    }

    /// Local peer bound to this factory. Without an identity a fresh one is
    /// generated; without an address `/ip4/0.0.0.0/tcp/0` is used. The address
    /// is annotated with the peer id.
    pub fn create_local_peer(&self, identity: Option<Identity>, address: Option<Multiaddr>) -> LocalPeer {
        let identity = identity.unwrap_or_else(Identity::generate);
        let address = address.unwrap_or_else(|| {
            Multiaddr::from(vec![
                AddrComponent::Ip4(Ipv4Addr::UNSPECIFIED),
                AddrComponent::Tcp(0),
            ])
        });
        let address = address.with_peer_id(identity.peer_id());
        debug!(peer = %identity.peer_id().short(), addr = %address, "local peer created");
        LocalPeer::new(self.clone(), identity, address)
    }

    /// Next diagnostic context id. Monotonic per factory.
    pub fn next_context_id(&self) -> ContextId {
        ContextId(self.inner.next_context_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub async fn listen(
        &self,
        local: &LocalPeer,
        address: &Multiaddr,
        token: &CancellationToken,
    ) -> PeerResult<Listener> {
        if token.is_cancelled() {
            return Err(PeerError::Cancelled);
        }
        let address = address.with_peer_id(local.peer_id());

        let (handle, channel) = Channel::pair();
        handle.close_on(token);
        let (context, (bound_rx, arrivals)) = PeerContext::for_listener(
            self.next_context_id(),
            local.clone(),
            handle.clone(),
            address,
        );
        let ctx = context.id();
        self.spawn_protocol(channel, context, false);

        let bound = tokio::select! {
            biased;
            _ = token.cancelled() => Err(PeerError::Cancelled),
            bound = bound_rx => bound.unwrap_or(Err(PeerError::ConnectionClosed)),
        };
        let bound = match bound {
            Ok(bound) => bound,
            Err(e) => {
                handle.close();
                return Err(cancelled_or(token, e));
            }
        };
        local.set_address(bound.clone());
        info!(%ctx, addr = %bound, "listener ready");

        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_arrivals(handle.clone(), arrivals, tx);
        Ok(Listener::new(bound, local.clone(), handle, rx))
    }

    pub async fn dial(
        &self,
        local: &LocalPeer,
        address: &Multiaddr,
        token: &CancellationToken,
    ) -> PeerResult<RemotePeer> {
        if token.is_cancelled() {
            return Err(PeerError::Cancelled);
        }
        let (handle, channel) = Channel::pair();
        handle.close_on(token);
        let (context, ready) = PeerContext::for_dialer(
            self.next_context_id(),
            local.clone(),
            handle.clone(),
            address.clone(),
        );
        let ctx = context.id();
        debug!(%ctx, addr = %address, "dialing");
        self.spawn_protocol(channel, context, true);

        let remote = tokio::select! {
            biased;
            _ = token.cancelled() => Err(PeerError::Cancelled),
            remote = ready => remote.unwrap_or(Err(PeerError::ConnectionClosed)),
        };
        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => {
                handle.close();
                let e = cancelled_or(token, e);
                debug!(%ctx, addr = %address, error = %e, "dial failed");
                return Err(e);
            }
        };

        let hooked = tokio::select! {
            biased;
            _ = token.cancelled() => Err(PeerError::Cancelled),
            result = self.inner.hook.connected_to(&remote, true) => result,
        };
        if let Err(e) = hooked {
            warn!(%ctx, peer = %remote.peer_id().short(), error = %e, "connection hook failed");
            handle.close();
            return Err(e);
        }
        Ok(remote)
    }

    /// Queue a request for `protocol_id` on `context` and wait until the
    /// outer protocol has run it to completion.
    pub async fn dial_sub_protocol(
        &self,
        context: &Arc<PeerContext>,
        protocol_id: &str,
        token: &CancellationToken,
    ) -> PeerResult<()> {
        if token.is_cancelled() {
            return Err(PeerError::Cancelled);
        }
        if !self.inner.upgrader.supports(protocol_id) {
            return Err(PeerError::UnknownProtocol(protocol_id.to_string()));
        }
        let (request, completion) = ChannelRequest::new(protocol_id, token.clone());
        context.enqueue(request);
        let channel = context.channel().clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(PeerError::Cancelled),
            result = completion => result.unwrap_or(Err(PeerError::ConnectionClosed)),
            _ = channel.closed() => Err(PeerError::ConnectionClosed),
        }
    }

    fn spawn_protocol(&self, channel: Channel, context: Arc<PeerContext>, dialer: bool) {
        let protocol = self.inner.protocol.clone();
        let upgrader = self.inner.upgrader.clone();
        tokio::spawn(async move {
            let ctx = context.clone();
            let result = if dialer {
                protocol.dial(channel.clone(), upgrader, context).await
            } else {
                protocol.listen(channel.clone(), upgrader, context).await
            };
            let error = match result {
                Ok(()) => {
                    debug!(ctx = %ctx.id(), "outer protocol finished");
                    PeerError::ConnectionClosed
                }
                Err(e) => {
                    debug!(ctx = %ctx.id(), error = %e, "outer protocol failed");
                    e
                }
            };
            ctx.fail_pending(error);
            channel.close();
        });
    }

    /// Forward negotiated inbound peers to the listener in arrival order,
    /// running the connection hook on each one first.
    fn spawn_arrivals(
        &self,
        handle: Channel,
        mut arrivals: mpsc::UnboundedReceiver<RemotePeer>,
        listener: mpsc::UnboundedSender<RemotePeer>,
    ) {
        let hook = self.inner.hook.clone();
        tokio::spawn(async move {
            loop {
                let remote = tokio::select! {
                    remote = arrivals.recv() => remote,
                    _ = handle.closed() => None,
                };
                let Some(remote) = remote else { break };
                let hooked = tokio::select! {
                    result = hook.connected_to(&remote, false) => result,
                    _ = handle.closed() => break,
                };
                match hooked {
                    Ok(()) => {
                        let _ = listener.send(remote);
                    }
                    Err(e) => {
                        warn!(ctx = %remote.context_id(), error = %e, "connection hook failed");
                        remote.disconnect();
                    }
                }
            }
        });
    }
}

fn cancelled_or(token: &CancellationToken, error: PeerError) -> PeerError {
    if token.is_cancelled() {
        PeerError::Cancelled
    } else {
        error
    }
}

impl std::fmt::Debug for PeerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerFactory")
            .field("outer_protocol", &self.outer_protocol_id())
            .field("sub_protocols", &self.inner.upgrader.registry().ids().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Multiplexer;
    use crate::transport::Transports;

    fn mux() -> Arc<dyn Protocol> {
        Arc::new(Multiplexer::new(Transports::new()))
    }

    #[test]
    fn build_requires_outer_protocol() {
        let err = PeerFactory::builder().build().unwrap_err();
        assert!(matches!(err, PeerError::NotConfigured("outer protocol")));
    }

    #[test]
    fn outer_protocol_set_once() {
        let err = PeerFactory::builder()
            .outer_protocol(mux())
            .outer_protocol(mux())
            .build()
            .unwrap_err();
        assert!(matches!(err, PeerError::AlreadyConfigured("outer protocol")));
    }

    #[test]
    fn local_peer_defaults() {
        let factory = PeerFactory::builder().outer_protocol(mux()).build().unwrap();
        let peer = factory.create_local_peer(None, None);
        let expected = format!("/ip4/0.0.0.0/tcp/0/p2p/{}", peer.peer_id());
        assert_eq!(peer.address().to_string(), expected);
        assert!(peer.same_peer(&peer.clone()));
        assert!(!peer.same_peer(&factory.create_local_peer(None, None)));
    }

    #[test]
    fn supplied_identity_kept() {
        let factory = PeerFactory::builder().outer_protocol(mux()).build().unwrap();
        let identity = Identity::generate();
        let id = identity.peer_id();
        let peer = factory.create_local_peer(Some(identity), Some(Multiaddr::memory(3)));
        assert_eq!(peer.peer_id(), id);
        assert_eq!(peer.address(), Multiaddr::memory(3).with_peer_id(id));
    }

    #[test]
    fn context_ids_increase() {
        let factory = PeerFactory::builder().outer_protocol(mux()).build().unwrap();
        let a = factory.next_context_id();
        let b = factory.next_context_id();
        assert!(b > a);
        assert_eq!(a.to_string(), "ctx-1");
    }

    #[tokio::test]
    async fn cancelled_token_fails_fast() {
        let factory = PeerFactory::builder().outer_protocol(mux()).build().unwrap();
        let peer = factory.create_local_peer(None, Some(Multiaddr::memory(0)));
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            peer.dial(&Multiaddr::memory(1), &token).await,
            Err(PeerError::Cancelled)
        ));
        assert!(matches!(
            peer.listen(&Multiaddr::memory(0), &token).await,
            Err(PeerError::Cancelled)
        ));
    }
}
