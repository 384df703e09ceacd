//! Daemon wiring: factory, listener, routing table, discovery and the per-peer connect loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use peerlink_core::{
    ConnectionHook, Discovery, DiscoveryEvent, DiscoverySink, Listener, LocalPeer, Multiaddr,
    Multiplexer, PeerFactory, PeerResult, RemotePeer, StaticDiscovery, Transports,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::MulticastDiscovery;
use crate::protocols::{PeerExchange, Ping, EXCHANGE_PROTOCOL_ID, PING_PROTOCOL_ID};
use crate::routing::RoutingTable;
use crate::transport::TcpTransport;

/// Logs every negotiated connection.
struct ConnectionLog;

#[async_trait]
impl ConnectionHook for ConnectionLog {
    async fn connected_to(&self, remote: &RemotePeer, is_dialer: bool) -> PeerResult<()> {
        let direction = if is_dialer { "outbound" } else { "inbound" };
        info!(
            ctx = %remote.context_id(),
            peer = %remote.peer_id().short(),
            addr = %remote.address(),
            direction,
            "connected"
        );
        Ok(())
    }
}

/// Multiplexed TCP factory serving peer exchange and ping.
pub fn build_factory(table: Arc<RoutingTable>, ping: Arc<Ping>) -> PeerResult<PeerFactory> {
    let transports = Transports::new().with(TcpTransport);
    PeerFactory::builder()
        .outer_protocol(Arc::new(Multiplexer::new(transports)))
        .app_protocol(Arc::new(PeerExchange::new(table)))
        .app_protocol(ping)
        .hook(Arc::new(ConnectionLog))
        .build()
}

pub struct Node {
    local_peer: LocalPeer,
    listener: Arc<Listener>,
    table: Arc<RoutingTable>,
    ping: Arc<Ping>,
}

impl Node {
    /// Listen on `config.listen_addr` and start dialing whatever discovery
    /// reports. Everything stops when `token` is cancelled.
    pub async fn start(config: &Config, token: CancellationToken) -> anyhow::Result<Node> {
        let (table, added) = RoutingTable::new();
        let table = Arc::new(table);
        let interval = Duration::from_secs(config.ping_interval_secs.max(1));
        let ping = Arc::new(Ping::new(interval));
        let factory = build_factory(table.clone(), ping.clone())?;

        let local_peer = factory.create_local_peer(None, None);
        let listener = local_peer
            .listen(&config.listen_addr, &token)
            .await
            .with_context(|| format!("listen on {}", config.listen_addr))?;
        table.set_local_peer(local_peer.clone())?;
        table.set_local_listener_address(listener.address().clone())?;
        info!(peer = %local_peer.peer_id(), addr = %listener.address(), "node started");

        let listener = Arc::new(listener);
        tokio::spawn(accept_loop(listener.clone()));
        tokio::spawn(dial_loop(local_peer.clone(), table.clone(), added, token.clone()));

        let (sink, events) = DiscoverySink::channel();
        let mut mechanisms: Vec<Box<dyn Discovery>> =
            vec![Box::new(StaticDiscovery::new(config.bootstrap.clone()))];
        if config.discovery {
            mechanisms.push(Box::new(MulticastDiscovery::new(config.discovery_port)));
        }
        for mechanism in mechanisms {
            let local_addr = listener.address().clone();
            let sink = sink.clone();
            let token = token.clone();
            tokio::spawn(async move {
                if let Err(e) = mechanism.discover(local_addr, sink, token).await {
                    warn!(discovery = mechanism.id(), error = %e, "discovery stopped");
                }
            });
        }
        tokio::spawn(discovery_events(table.clone(), events));

        Ok(Node {
            local_peer,
            listener,
            table,
            ping,
        })
    }

    pub fn local_peer(&self) -> &LocalPeer {
        &self.local_peer
    }

    pub fn listener_address(&self) -> &Multiaddr {
        self.listener.address()
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn ping(&self) -> &Arc<Ping> {
        &self.ping
    }
}

async fn accept_loop(listener: Arc<Listener>) {
    while let Some(remote) = listener.accept().await {
        debug!(peer = %remote.peer_id().short(), addr = %remote.address(), "accepted");
    }
    debug!(addr = %listener.address(), "listener closed");
}

async fn dial_loop(
    local: LocalPeer,
    table: Arc<RoutingTable>,
    mut added: mpsc::UnboundedReceiver<Multiaddr>,
    token: CancellationToken,
) {
    loop {
        let address = tokio::select! {
            _ = token.cancelled() => return,
            address = added.recv() => match address {
                Some(address) => address,
                None => return,
            },
        };
        tokio::spawn(connect(local.clone(), table.clone(), address, token.clone()));
    }
}

/// Dial, exchange peers, then ping until the connection drops.
async fn connect(
    local: LocalPeer,
    table: Arc<RoutingTable>,
    address: Multiaddr,
    token: CancellationToken,
) {
    let remote = match local.dial(&address, &token).await {
        Ok(remote) => remote,
        Err(e) => {
            if !e.is_cancelled() {
                warn!(addr = %address, error = %e, "dial failed");
            }
            table.remove(&address);
            return;
        }
    };
    let peer = remote.peer_id().short();
    match remote.dial(EXCHANGE_PROTOCOL_ID, &token).await {
        Ok(()) => {
            let result = remote.dial(PING_PROTOCOL_ID, &token).await;
            info!(%peer, addr = %address, result = ?result, "connection ended");
        }
        Err(e) => warn!(%peer, addr = %address, error = %e, "peer exchange failed"),
    }
    remote.disconnect();
    table.remove(&address);
}

async fn discovery_events(table: Arc<RoutingTable>, mut events: mpsc::UnboundedReceiver<DiscoveryEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::Added(addresses) => {
                for address in addresses {
                    table.add(address);
                }
            }
            // Known peers leave the table when their connection drops.
            DiscoveryEvent::Removed(addresses) => {
                debug!(count = addresses.len(), "discovery lost peers");
            }
        }
    }
}
