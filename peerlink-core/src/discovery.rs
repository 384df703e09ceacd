//! Discovery seam: mechanisms report candidate addresses, the caller dials them.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::address::Multiaddr;
use crate::error::PeerResult;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DiscoveryEvent {
    Added(Vec<Multiaddr>),
    Removed(Vec<Multiaddr>),
}

/// Add/remove callback pair handed to a discovery mechanism.
#[derive(Clone)]
pub struct DiscoverySink {
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl DiscoverySink {
    pub fn channel() -> (DiscoverySink, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DiscoverySink { tx }, rx)
    }

    pub fn add_peer(&self, addresses: Vec<Multiaddr>) {
        if !addresses.is_empty() {
            let _ = self.tx.send(DiscoveryEvent::Added(addresses));
        }
    }

    pub fn remove_peer(&self, addresses: Vec<Multiaddr>) {
        if !addresses.is_empty() {
            let _ = self.tx.send(DiscoveryEvent::Removed(addresses));
        }
    }
}

#[async_trait]
pub trait Discovery: Send + Sync {
    fn id(&self) -> &str;

    /// Advertise `local_addr` and report peers to `sink` until `token` is cancelled.
    async fn discover(
        &self,
        local_addr: Multiaddr,
        sink: DiscoverySink,
        token: CancellationToken,
    ) -> PeerResult<()>;
}

/// Fixed bootstrap list, reported once.
pub struct StaticDiscovery {
    addresses: Vec<Multiaddr>,
}

impl StaticDiscovery {
    pub fn new(addresses: Vec<Multiaddr>) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    fn id(&self) -> &str {
        "static"
    }

    async fn discover(
        &self,
        _local_addr: Multiaddr,
        sink: DiscoverySink,
        token: CancellationToken,
    ) -> PeerResult<()> {
        debug!(count = self.addresses.len(), "reporting bootstrap peers");
        for address in &self.addresses {
            sink.add_peer(vec![address.clone()]);
        }
        token.cancelled().await;
        Ok(())
    }
}
