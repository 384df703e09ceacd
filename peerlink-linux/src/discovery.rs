//! LAN discovery: UDP multicast beacon carrying our listen address, peer list with timeouts.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use peerlink_core::{CancellationToken, Discovery, DiscoverySink, Multiaddr, PeerId, PeerResult};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 70, 70);
const BEACON_INTERVAL: Duration = Duration::from_secs(5);
const PEER_TIMEOUT: Duration = Duration::from_secs(20);
const BEACON_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Beacon {
    version: u8,
    /// Per-process id so our own looped-back beacons are ignored.
    instance: Uuid,
    addr: String,
}

struct PeerState {
    addr: Multiaddr,
    last_seen: Instant,
}

type Peers = Arc<Mutex<HashMap<PeerId, PeerState>>>;

pub struct MulticastDiscovery {
    port: u16,
    instance: Uuid,
    beacon_interval: Duration,
    peer_timeout: Duration,
}

impl MulticastDiscovery {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            instance: Uuid::new_v4(),
            beacon_interval: BEACON_INTERVAL,
            peer_timeout: PEER_TIMEOUT,
        }
    }

    pub fn with_intervals(mut self, beacon_interval: Duration, peer_timeout: Duration) -> Self {
        self.beacon_interval = beacon_interval;
        self.peer_timeout = peer_timeout;
        self
    }
}

#[async_trait]
impl Discovery for MulticastDiscovery {
    fn id(&self) -> &str {
        "multicast"
    }

    async fn discover(
        &self,
        local_addr: Multiaddr,
        sink: DiscoverySink,
        token: CancellationToken,
    ) -> PeerResult<()> {
        let socket = Arc::new(make_multicast_socket(self.port)?);
        let peers: Peers = Arc::new(Mutex::new(HashMap::new()));
        let beacon = Beacon {
            version: BEACON_VERSION,
            instance: self.instance,
            addr: local_addr.to_string(),
        };
        info!(port = self.port, group = %MULTICAST_GROUP, "multicast discovery started");
        let own_id = local_addr.peer_id();
        tokio::select! {
            r = beacon_loop(socket.clone(), beacon, self.port, self.beacon_interval) => r,
            r = recv_loop(socket, peers.clone(), self.instance, own_id, sink.clone()) => r,
            r = peer_timeout_loop(peers, sink, self.beacon_interval, self.peer_timeout) => r,
            _ = token.cancelled() => Ok(()),
        }
    }
}

fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    beacon: Beacon,
    port: u16,
    interval: Duration,
) -> PeerResult<()> {
    let payload = bincode::serialize(&beacon)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest = SocketAddr::new(IpAddr::V4(MULTICAST_GROUP), port);
    loop {
        if let Err(e) = socket.send_to(&payload, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(interval).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    peers: Peers,
    instance: Uuid,
    own_id: Option<PeerId>,
    sink: DiscoverySink,
) -> PeerResult<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Ok(beacon) = bincode::deserialize::<Beacon>(&buf[..n]) else {
            debug!(%from, "ignoring malformed beacon");
            continue;
        };
        let Some(addr) = beacon_address(&beacon, from, instance, own_id) else {
            continue;
        };
        let Some(peer_id) = addr.peer_id() else {
            continue;
        };
        let is_new = {
            let mut p = peers.lock().await;
            let is_new = !p.contains_key(&peer_id);
            p.insert(
                peer_id,
                PeerState {
                    addr: addr.clone(),
                    last_seen: Instant::now(),
                },
            );
            is_new
        };
        if is_new {
            debug!(peer = %peer_id.short(), %addr, "peer discovered");
            sink.add_peer(vec![addr]);
        }
    }
}

async fn peer_timeout_loop(
    peers: Peers,
    sink: DiscoverySink,
    interval: Duration,
    timeout: Duration,
) -> PeerResult<()> {
    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let timed_out: Vec<Multiaddr> = {
            let mut p = peers.lock().await;
            let stale: Vec<PeerId> = p
                .iter()
                .filter(|(_, s)| now.duration_since(s.last_seen) >= timeout)
                .map(|(id, _)| *id)
                .collect();
            stale
                .iter()
                .filter_map(|id| p.remove(id))
                .map(|s| s.addr)
                .collect()
        };
        if !timed_out.is_empty() {
            debug!(count = timed_out.len(), "peers timed out");
            sink.remove_peer(timed_out);
        }
    }
}

/// Dialable address advertised by `beacon`, or `None` for our own beacons,
/// other versions and unusable addresses. An unspecified IP is replaced by
/// the address the beacon came from.
fn beacon_address(
    beacon: &Beacon,
    from: SocketAddr,
    instance: Uuid,
    own_id: Option<PeerId>,
) -> Option<Multiaddr> {
    if beacon.version != BEACON_VERSION || beacon.instance == instance {
        return None;
    }
    let addr: Multiaddr = match beacon.addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(%from, error = %e, "beacon with invalid address");
            return None;
        }
    };
    let peer_id = addr.peer_id()?;
    if Some(peer_id) == own_id {
        return None;
    }
    let unspecified = addr.socket_addr()?.ip().is_unspecified();
    if !unspecified {
        return Some(addr);
    }
    Some(addr.with_ip(from.ip()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::Identity;

    fn beacon(addr: String) -> Beacon {
        Beacon {
            version: BEACON_VERSION,
            instance: Uuid::new_v4(),
            addr,
        }
    }

    #[test]
    fn unspecified_ip_replaced_by_sender() {
        let id = Identity::generate().peer_id();
        let b = beacon(format!("/ip4/0.0.0.0/tcp/45679/p2p/{}", id));
        let from: SocketAddr = "192.168.1.20:45678".parse().unwrap();
        let addr = beacon_address(&b, from, Uuid::new_v4(), None).unwrap();
        assert_eq!(
            addr.to_string(),
            format!("/ip4/192.168.1.20/tcp/45679/p2p/{}", id)
        );
    }

    #[test]
    fn unspecified_ip_replaced_by_ipv6_sender() {
        let id = Identity::generate().peer_id();
        let b = beacon(format!("/ip4/0.0.0.0/tcp/45679/p2p/{}", id));
        let from: SocketAddr = "[fe80::7]:45678".parse().unwrap();
        let addr = beacon_address(&b, from, Uuid::new_v4(), None).unwrap();
        assert_eq!(
            addr.to_string(),
            format!("/ip6/fe80::7/tcp/45679/p2p/{}", id)
        );
        assert_eq!(addr.socket_addr(), Some("[fe80::7]:45679".parse().unwrap()));
    }

    #[test]
    fn concrete_ip_kept() {
        let id = Identity::generate().peer_id();
        let b = beacon(format!("/ip4/10.1.1.1/tcp/9/p2p/{}", id));
        let from: SocketAddr = "192.168.1.20:45678".parse().unwrap();
        let addr = beacon_address(&b, from, Uuid::new_v4(), None).unwrap();
        assert_eq!(addr.socket_addr(), Some("10.1.1.1:9".parse().unwrap()));
    }

    #[test]
    fn own_and_foreign_beacons_filtered() {
        let id = Identity::generate().peer_id();
        let from: SocketAddr = "192.168.1.20:45678".parse().unwrap();
        let b = beacon(format!("/ip4/10.1.1.1/tcp/9/p2p/{}", id));

        assert!(beacon_address(&b, from, b.instance, None).is_none());
        assert!(beacon_address(&b, from, Uuid::new_v4(), Some(id)).is_none());

        let mut old = b.clone();
        old.version = BEACON_VERSION + 1;
        assert!(beacon_address(&old, from, Uuid::new_v4(), None).is_none());

        let anonymous = beacon("/ip4/10.1.1.1/tcp/9".into());
        assert!(beacon_address(&anonymous, from, Uuid::new_v4(), None).is_none());
        let garbage = beacon("not an address".into());
        assert!(beacon_address(&garbage, from, Uuid::new_v4(), None).is_none());
    }

    #[test]
    fn beacon_encoding_is_stable() {
        let b = beacon("/ip4/10.1.1.1/tcp/9".into());
        let bytes = bincode::serialize(&b).unwrap();
        let back: Beacon = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.instance, b.instance);
        assert_eq!(back.addr, b.addr);
    }
}
