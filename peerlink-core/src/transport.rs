//! Transport seam: turns an address into a connected or accepting [`Channel`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::address::{Multiaddr, Protocol as AddrComponent};
use crate::channel::Channel;
use crate::error::{PeerError, PeerResult};

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this transport can dial or listen on `address`.
    fn handles(&self, address: &Multiaddr) -> bool;

    async fn dial(&self, address: &Multiaddr) -> PeerResult<Channel>;

    async fn listen(&self, address: &Multiaddr) -> PeerResult<Box<dyn TransportListener>>;
}

#[async_trait]
pub trait TransportListener: Send {
    /// Address actually bound (ephemeral ports resolved).
    fn local_addr(&self) -> Multiaddr;

    /// Next inbound connection and the remote's transport address.
    /// Must be cancel safe.
    async fn accept(&mut self) -> PeerResult<(Channel, Multiaddr)>;
}

/// Set of transports an outer protocol can use.
#[derive(Clone, Default)]
pub struct Transports {
    transports: Vec<Arc<dyn Transport>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transport: impl Transport + 'static) -> Self {
        self.transports.push(Arc::new(transport));
        self
    }

    /// The one transport handling `address`.
    pub fn resolve(&self, address: &Multiaddr) -> PeerResult<Arc<dyn Transport>> {
        let mut matching = self.transports.iter().filter(|t| t.handles(address));
        match (matching.next(), matching.next()) {
            (Some(transport), None) => Ok(transport.clone()),
            (None, _) => Err(PeerError::UnsupportedAddress(address.clone())),
            (Some(_), Some(_)) => Err(PeerError::AmbiguousAddress(address.clone())),
        }
    }
}

type Backlog = mpsc::UnboundedSender<(Channel, Multiaddr)>;

/// In-process network: listeners registered by `/memory/<port>`.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    listeners: Mutex<HashMap<u64, Backlog>>,
    next_port: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_port(&self) -> u64 {
        loop {
            let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed) + 1;
            if !self.inner.listeners.lock().contains_key(&port) {
                return port;
            }
        }
    }
}

/// Transport over a [`MemoryHub`]. Handles `/memory/<port>` addresses.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: MemoryHub,
}

impl MemoryTransport {
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub }
    }
}

fn memory_port(address: &Multiaddr) -> Option<u64> {
    match address.iter().next() {
        Some(AddrComponent::Memory(port)) => Some(*port),
        _ => None,
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn handles(&self, address: &Multiaddr) -> bool {
        memory_port(address).is_some()
    }

    async fn dial(&self, address: &Multiaddr) -> PeerResult<Channel> {
        let port = memory_port(address).ok_or_else(|| PeerError::UnsupportedAddress(address.clone()))?;
        let backlog = self
            .hub
            .inner
            .listeners
            .lock()
            .get(&port)
            .cloned()
            .ok_or_else(|| PeerError::Transport(format!("connection refused: {}", address)))?;
        let (local, remote) = Channel::pair();
        let source = Multiaddr::memory(self.hub.allocate_port());
        backlog
            .send((remote, source))
            .map_err(|_| PeerError::Transport(format!("connection refused: {}", address)))?;
        Ok(local)
    }

    async fn listen(&self, address: &Multiaddr) -> PeerResult<Box<dyn TransportListener>> {
        let port = memory_port(address).ok_or_else(|| PeerError::UnsupportedAddress(address.clone()))?;
        let port = if port == 0 { self.hub.allocate_port() } else { port };
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut listeners = self.hub.inner.listeners.lock();
            if listeners.contains_key(&port) {
                return Err(PeerError::Transport(format!("address in use: /memory/{}", port)));
            }
            listeners.insert(port, tx);
        }
        debug!(port, "memory listener bound");
        Ok(Box::new(MemoryListener {
            hub: self.hub.clone(),
            port,
            backlog: rx,
        }))
    }
}

struct MemoryListener {
    hub: MemoryHub,
    port: u64,
    backlog: mpsc::UnboundedReceiver<(Channel, Multiaddr)>,
}

#[async_trait]
impl TransportListener for MemoryListener {
    fn local_addr(&self) -> Multiaddr {
        Multiaddr::memory(self.port)
    }

    async fn accept(&mut self) -> PeerResult<(Channel, Multiaddr)> {
        self.backlog
            .recv()
            .await
            .ok_or_else(|| PeerError::Transport("listener closed".into()))
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.hub.inner.listeners.lock().remove(&self.port);
        // refuse connections that were queued but never accepted
        self.backlog.close();
        while let Ok((pending, _)) = self.backlog.try_recv() {
            pending.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ReadMode;

    #[tokio::test]
    async fn dial_reaches_listener() {
        let transport = MemoryTransport::new(MemoryHub::new());
        let mut listener = transport.listen(&Multiaddr::memory(0)).await.unwrap();
        let bound = listener.local_addr();
        assert_ne!(bound, Multiaddr::memory(0));

        let client = transport.dial(&bound).await.unwrap();
        let (server, source) = listener.accept().await.unwrap();
        assert!(transport.handles(&source));

        client.write(&b"ping"[..]).await.unwrap();
        assert_eq!(&server.read(0, ReadMode::WaitAny).await.unwrap()[..], b"ping");
    }

    #[tokio::test]
    async fn refused_and_in_use() {
        let transport = MemoryTransport::new(MemoryHub::new());
        assert!(matches!(
            transport.dial(&Multiaddr::memory(42)).await,
            Err(PeerError::Transport(_))
        ));
        let listener = transport.listen(&Multiaddr::memory(42)).await.unwrap();
        assert!(matches!(
            transport.listen(&Multiaddr::memory(42)).await,
            Err(PeerError::Transport(_))
        ));
        drop(listener);
        assert!(transport.listen(&Multiaddr::memory(42)).await.is_ok());
    }

    #[tokio::test]
    async fn unaccepted_dials_close_with_listener() {
        let transport = MemoryTransport::new(MemoryHub::new());
        let listener = transport.listen(&Multiaddr::memory(0)).await.unwrap();
        let client = transport.dial(&listener.local_addr()).await.unwrap();
        drop(listener);
        let closed = tokio::time::timeout(std::time::Duration::from_secs(1), client.closed()).await;
        assert!(closed.is_ok());
        assert!(client.is_closed());
    }

    #[test]
    fn resolve_exactly_one() {
        let addr = Multiaddr::memory(1);
        let none = Transports::new();
        assert!(matches!(none.resolve(&addr), Err(PeerError::UnsupportedAddress(_))));

        let hub = MemoryHub::new();
        let one = Transports::new().with(MemoryTransport::new(hub.clone()));
        assert_eq!(one.resolve(&addr).unwrap().name(), "memory");

        let two = one.clone().with(MemoryTransport::new(hub));
        assert!(matches!(two.resolve(&addr), Err(PeerError::AmbiguousAddress(_))));

        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        assert!(matches!(one.resolve(&tcp), Err(PeerError::UnsupportedAddress(_))));
    }
}
