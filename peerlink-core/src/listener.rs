//! Accepting endpoint returned by `listen`.

use std::fmt;

use tokio::sync::{mpsc, Mutex};

use crate::address::Multiaddr;
use crate::channel::Channel;
use crate::peer::{LocalPeer, RemotePeer};

/// Bound endpoint of a local peer. Closed is terminal.
pub struct Listener {
    address: Multiaddr,
    local_peer: LocalPeer,
    channel: Channel,
    arrivals: Mutex<mpsc::UnboundedReceiver<RemotePeer>>,
}

impl Listener {
    pub(crate) fn new(
        address: Multiaddr,
        local_peer: LocalPeer,
        channel: Channel,
        arrivals: mpsc::UnboundedReceiver<RemotePeer>,
    ) -> Self {
        Self {
            address,
            local_peer,
            channel,
            arrivals: Mutex::new(arrivals),
        }
    }

    /// Bound address, annotated with the local peer id.
    pub fn address(&self) -> &Multiaddr {
        &self.address
    }

    pub fn local_peer(&self) -> &LocalPeer {
        &self.local_peer
    }

    /// Next remote peer whose connection finished negotiating, in arrival
    /// order. `None` once the listener is closed.
    pub async fn accept(&self) -> Option<RemotePeer> {
        let mut arrivals = self.arrivals.lock().await;
        tokio::select! {
            biased;
            peer = arrivals.recv() => peer,
            _ = self.channel.closed() => None,
        }
    }

    /// Stop listening and close every connection accepted through this listener.
    pub fn disconnect(&self) {
        self.channel.close();
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    pub async fn closed(&self) {
        self.channel.closed().await
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}
